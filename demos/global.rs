//! This example is designed to test the implementation of
//! the trait `GlobalAlloc` on our allocator. See [`MallocScaled`] to
//! see the actual trait implementation.

use scaledalloc::MallocScaled;
use std::{collections::HashMap, thread};

#[global_allocator]
static ALLOCATOR: MallocScaled = MallocScaled::new();

fn main() {
    // Box example
    let val_box = Box::new(22);
    println!("Box Value: {}, At: {:p}", val_box, val_box);

    // Vec example, grows through realloc
    let mut v = Vec::new();
    for i in 0..5 {
        v.push(i * 10);
        println!("Added {}; Capacity: {}; At: {:p}", v[i], v.capacity(), v.as_ptr());
    }

    // String example
    let msg = String::from("Heap Testing");
    println!("\nString '{}' - At: {:p}", msg, msg.as_ptr());

    let p1 = Box::new(2.22);
    let addr_p1 = format!("{:p}", p1);
    println!("P1 Allocated at: {}", addr_p1);

    drop(p1);
    println!("P1 Deallocated");

    let p2 = Box::new(2.22);
    let addr_p2 = format!("{:p}", p2);
    println!("P2 at: {}", addr_p2);

    // Same size class, the freed block comes back first
    let a = Box::new([0u8; 64]);
    let ptr_a = a.as_ptr();
    drop(a);

    let b = Box::new([1u8; 64]);
    let ptr_b = b.as_ptr();

    if ptr_a == ptr_b {
        println!("Correctly reused at {:p}", ptr_b);
    } else {
        println!("Not reused. A was at {:p} and B is at {:p}", ptr_a, ptr_b);
    }

    // Thread example test
    let workers: Vec<_> = (0..4)
        .map(|id| {
            thread::spawn(move || {
                let mut words = HashMap::new();
                for i in 0..10_000 {
                    *words.entry(format!("word-{}", i % 100)).or_insert(0) += id;
                }
                words.len()
            })
        })
        .collect();

    for worker in workers {
        println!("Worker saw {} words", worker.join().unwrap());
    }

    let stats = ALLOCATOR.stats();
    println!(
        "{} mallocs, {} reallocs ({} moved), {} bytes in use, peak {}",
        stats.malloc_requests, stats.realloc_requests, stats.relocations, stats.used, stats.peak_used
    );
}
