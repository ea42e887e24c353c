use scaledalloc::{Config, MallocScaled};

fn log_alloc(allocator: &MallocScaled, addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");

    if let Some((base, sub)) = allocator.bucket_of(size) {
        println!(
            "Served by pool ({base}, {sub}) of {} byte blocks",
            allocator.block_size(base, sub)
        );
    }
}

fn main() {
    let allocator = MallocScaled::with_config(Config::new().with_arena_min_size(16 << 20));

    if !allocator.init() {
        eprintln!("Cannot initialize the allocator");
        return;
    }

    unsafe {
        let addr1 = allocator.malloc(8, 0);
        log_alloc(&allocator, addr1, 8);

        let addr2 = allocator.malloc(1000, 0);
        log_alloc(&allocator, addr2, 1000);

        let addr3 = allocator.malloc(100, 256);
        log_alloc(&allocator, addr3, 100);
        println!("Aligned to 256: {}", addr3 as usize % 256 == 0);

        let grown = allocator.realloc(addr2, 1100, 0);
        println!("Grown in place: {}", grown == addr2);

        let moved = allocator.realloc(grown, 5000, 0);
        println!("Moved to {moved:?}, {} bytes", allocator.allocation_size(moved));

        allocator.free(addr1);
        allocator.free(moved);
        allocator.free(addr3);

        let reused = allocator.malloc(8, 0);
        println!("Freed block reused: {}", reused == addr1);
        allocator.free(reused);
    }

    println!("{:#?}", allocator.stats());
    allocator.shutdown();
}
