//! Scalable size class allocator.
//!
//! Memory is handled in two tiers. At the bottom, the [`PageAllocator`]
//! reserves big virtual memory arenas and splits them into page aligned runs.
//! On top of it, every request is bucketed into a size class whose pool hands
//! out equal blocks carved from those runs:
//!
//! ```text
//! +--------------+     +-----------+     +------------+     +-----------+
//! | MallocScaled | --> | PoolTable | --> | Pool       | --> | PoolBlock | --> blocks
//! +--------------+     +-----------+     +------------+     +-----------+
//!                                                                 |
//!                                                           +---------------+
//!                                                           | PageAllocator | --> arenas
//!                                                           +---------------+
//! ```
//!
//! ```
//! use scaledalloc::{Config, MallocScaled};
//!
//! let allocator = MallocScaled::with_config(Config::new().with_arena_min_size(16 << 20));
//! assert!(allocator.init());
//!
//! let ptr = allocator.malloc(100, 64);
//! assert_eq!(ptr as usize % 64, 0);
//!
//! unsafe {
//!     assert_eq!(allocator.allocation_size(ptr), 100);
//!     allocator.free(ptr);
//! }
//!
//! allocator.shutdown();
//! ```

mod arena;
mod block;
mod config;
mod error;
mod freelist;
mod kernel;
mod list;
mod malloc;
mod page_alloc;
mod pool;
mod pool_table;
mod slots;
mod stats;
mod utils;
mod vm_block;

pub use config::{Config, DEFAULT_ALIGNMENT, MAX_SUB_INDEX_COUNT};
pub use error::AllocError;
pub use kernel::{Access, Kernel, MemoryBlock, PlatformMemory};
pub use malloc::MallocScaled;
pub use page_alloc::PageAllocator;
pub use stats::{MallocStats, PageStats};
