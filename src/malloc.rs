//! Allocator facade. Every request goes through a single lock, then down to
//! the pool of its size class:
//!
//! ```text
//!  malloc(size, alignment)
//!     |
//!     v
//!  adjusted = align(size + size / 8, 16) + alignment
//!     |
//!     v
//!  PoolTable::bucket(adjusted) --> Pool --> PoolBlock --> BlockHeader
//!                                               |
//!                                               v
//!                                    VmBlock (PageAllocator run)
//! ```

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use parking_lot::{Mutex, const_mutex};

use crate::{
    block::{self, BLOCK_HEADER_SIZE, HEADER_OFFSET_SIZE},
    config::{Config, DEFAULT_ALIGNMENT},
    error::AllocError,
    kernel::{Kernel, PlatformMemory},
    page_alloc::PageAllocator,
    pool_table::PoolTable,
    stats::MallocStats,
    utils::checked_align,
};

/// Bytes a request of `size` needs from its pool: a slack of one eighth for
/// cheap in place growth plus the worst case alignment padding.
fn adjusted_size(size: usize, alignment: usize) -> Option<usize> {
    checked_align(size.checked_add(size / 8)?, DEFAULT_ALIGNMENT)?.checked_add(alignment)
}

fn report(operation: &str, err: AllocError) {
    match err {
        #[cfg(feature = "validation")]
        AllocError::CorruptedPool(_) => log::error!("{operation}: {err}"),
        _ => log::trace!("{operation} failed: {err}"),
    }
}

/// Everything guarded by the facade lock.
struct Heap<P: PlatformMemory> {
    pages: PageAllocator<P>,
    table: PoolTable,
    stats: MallocStats,
}

// The raw pointers inside only ever point to memory owned by the heap itself.
unsafe impl<P: PlatformMemory + Send> Send for Heap<P> {}

impl<P: PlatformMemory> Heap<P> {
    const fn new(platform: P) -> Self {
        Self {
            pages: PageAllocator::new(platform),
            table: PoolTable::new(),
            stats: MallocStats::EMPTY,
        }
    }

    #[inline]
    fn is_initialized(&self) -> bool {
        self.table.is_initialized()
    }

    fn init(&mut self, config: &Config) -> Result<(), AllocError> {
        if self.is_initialized() {
            return Err(AllocError::AlreadyInitialized);
        }

        config.validate(self.pages.platform().page_size())?;
        self.pages.init(config)?;

        if let Err(err) = self.table.init(&mut self.pages, config) {
            self.pages.release();
            return Err(err);
        }

        self.stats = MallocStats::EMPTY;
        log::debug!("allocator initialized with {config:?}");

        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.is_initialized() {
            return;
        }

        self.table.release(&mut self.pages);

        if !self.pages.release() {
            log::warn!("some arenas could not be given back to the OS");
        }

        self.stats = MallocStats::EMPTY;
        log::debug!("allocator shut down");
    }

    /// Resolves the alignment of a request. Zero means the default one.
    fn alignment(&self, alignment: usize) -> Result<usize, AllocError> {
        if alignment == 0 {
            return Ok(DEFAULT_ALIGNMENT);
        }

        #[cfg(feature = "validation")]
        {
            if !crate::utils::is_pow2(alignment) || alignment > self.pages.page_size() {
                return Err(AllocError::InvalidAlignment(alignment));
            }
        }

        Ok(alignment.max(DEFAULT_ALIGNMENT))
    }

    fn malloc(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        self.stats.malloc_requests += 1;

        let result = self.alignment(alignment).and_then(|alignment| self.allocate(size, alignment));
        if result.is_err() {
            self.stats.failed_mallocs += 1;
        }

        result
    }

    fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        if !self.is_initialized() {
            return Err(AllocError::NotInitialized);
        }

        let adjusted = adjusted_size(size, alignment).ok_or(AllocError::SizeOutOfRange(size))?;
        let (base, sub) = self.table.bucket(adjusted)?;
        let pool = self.table.pool_mut(base, sub).ok_or(AllocError::SizeOutOfRange(adjusted))?;

        let header = pool.get_free_block(&mut self.pages, size)?;
        let user = unsafe { block::encode(header, alignment) };

        self.stats.on_alloc(size);
        log::trace!("malloc({size}, {alignment}) = {user:p} from pool ({base}, {sub})");

        Ok(user)
    }

    /// **SAFETY**: `user` must be a live pointer handed out by this heap.
    unsafe fn free(&mut self, user: NonNull<u8>) {
        self.stats.free_requests += 1;

        let header = unsafe { block::decode(user) };
        let (used_size, block_size) = unsafe { (header.as_ref().used_size, header.as_ref().block_size) };
        let policy = self.table.policy();

        let Some(pool) = self.table.owner_mut(block_size) else {
            log::warn!("free({user:p}): no pool serves blocks of {block_size} bytes");
            return;
        };

        unsafe { pool.free_user_block(&mut self.pages, header, policy) };

        self.stats.on_free(used_size);
        log::trace!("free({user:p}) of {used_size} bytes");
    }

    /// **SAFETY**: `user` must be a live pointer handed out by this heap.
    unsafe fn realloc(&mut self, user: NonNull<u8>, new_size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        self.stats.realloc_requests += 1;

        let result = self
            .alignment(alignment)
            .and_then(|alignment| unsafe { self.resize(user, new_size, alignment) });

        if result.is_err() {
            self.stats.failed_reallocs += 1;
        }

        result
    }

    unsafe fn resize(&mut self, user: NonNull<u8>, new_size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        let adjusted = adjusted_size(new_size, alignment).ok_or(AllocError::SizeOutOfRange(new_size))?;

        let mut header = unsafe { block::decode(user) };
        let (used_size, block_size) = unsafe { (header.as_ref().used_size, header.as_ref().block_size) };
        let preserved = used_size.min(new_size);

        if adjusted > block_size || adjusted < block_size >> 4 {
            let moved = self.allocate(new_size, alignment)?;

            unsafe {
                ptr::copy_nonoverlapping(user.as_ptr(), moved.as_ptr(), preserved);
                self.free(user);
            }
            // `free` counts itself as a request of its own.
            self.stats.free_requests -= 1;
            self.stats.relocations += 1;

            log::trace!("realloc({user:p}, {new_size}) moved to {moved:p}");

            return Ok(moved);
        }

        let offset = user.as_ptr() as usize - header.as_ptr() as usize;
        let new_offset = block::user_offset(header, alignment);

        let target = match offset == new_offset {
            true => user,
            false => unsafe {
                let target = header.cast::<u8>().add(new_offset);
                ptr::copy(user.as_ptr(), target.as_ptr(), preserved);
                block::write_offset(target, header);
                target
            },
        };

        unsafe { header.as_mut().used_size = new_size };
        self.stats.on_resize(used_size, new_size);

        log::trace!("realloc({user:p}, {new_size}) in place at {target:p}");

        Ok(target)
    }

    fn stats(&self) -> MallocStats {
        let mut stats = self.stats;

        for pool in self.table.pools() {
            stats.pool_memory += pool.memory();
            stats.pool_blocks += pool.pool_block_count();
        }
        stats.page = self.pages.stats();

        stats
    }
}

/// Scalable allocator. Requests are bucketed into size classes, each served by
/// a pool of equal blocks carved out of page runs of big virtual memory
/// arenas.
///
/// It has to be initialized with [`MallocScaled::init`] before use, unless it
/// is the global allocator, which initializes itself on first use:
///
/// ```no_run
/// use scaledalloc::MallocScaled;
///
/// #[global_allocator]
/// static ALLOCATOR: MallocScaled = MallocScaled::new();
///
/// fn main() {
///     let numbers = vec![1, 2, 3];
///     assert_eq!(numbers.len(), 3);
/// }
/// ```
///
/// Every entry point takes the same lock for its whole duration. When this is
/// the global allocator, a logger must not allocate while logging for it, or
/// it will deadlock.
pub struct MallocScaled<P: PlatformMemory = Kernel> {
    heap: Mutex<Heap<P>>,
    config: Config,
}

impl MallocScaled<Kernel> {
    /// Allocator with the default [`Config`] on top of the OS.
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub const fn with_config(config: Config) -> Self {
        Self::with_platform(Kernel, config)
    }
}

impl Default for MallocScaled<Kernel> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PlatformMemory> MallocScaled<P> {
    /// Allocator taking its memory from `platform`.
    pub const fn with_platform(platform: P, config: Config) -> Self {
        Self {
            heap: const_mutex(Heap::new(platform)),
            config,
        }
    }

    /// Same as [`MallocScaled::try_init`], only telling whether it worked.
    pub fn init(&self) -> bool {
        match self.try_init() {
            Ok(()) => true,
            Err(err) => {
                log::warn!("cannot initialize allocator: {err}");
                false
            }
        }
    }

    /// Validates the config, sets up the arena table and the pool table.
    pub fn try_init(&self) -> Result<(), AllocError> {
        self.heap.lock().init(&self.config)
    }

    /// Gives every arena back to the OS. Any pointer still alive dangles.
    pub fn shutdown(&self) {
        self.heap.lock().shutdown();
    }

    pub fn is_initialized(&self) -> bool {
        self.heap.lock().is_initialized()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Allocates `size` bytes aligned to `alignment`, zero meaning
    /// [`DEFAULT_ALIGNMENT`]. Returns null when `size` is zero or on failure.
    pub fn malloc(&self, size: usize, alignment: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        match self.heap.lock().malloc(size, alignment) {
            Ok(user) => user.as_ptr(),
            Err(err) => {
                report("malloc", err);
                ptr::null_mut()
            }
        }
    }

    /// Resizes the allocation at `ptr`, in place when its block still fits
    /// `new_size`. Null `ptr` allocates, zero `new_size` frees. On failure
    /// null is returned and `ptr` is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize, alignment: usize) -> *mut u8 {
        let Some(user) = NonNull::new(ptr) else {
            return self.malloc(new_size, alignment);
        };

        if new_size == 0 {
            unsafe { self.free(ptr) };
            return ptr::null_mut();
        }

        match unsafe { self.heap.lock().realloc(user, new_size, alignment) } {
            Ok(user) => user.as_ptr(),
            Err(err) => {
                report("realloc", err);
                ptr::null_mut()
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(user) = NonNull::new(ptr) else {
            return;
        };

        let mut heap = self.heap.lock();

        if heap.is_initialized() {
            unsafe { heap.free(user) };
        }
    }

    /// Bytes requested for the allocation at `ptr`, zero for null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator.
    pub unsafe fn allocation_size(&self, ptr: *mut u8) -> usize {
        let Some(user) = NonNull::new(ptr) else {
            return 0;
        };

        let _heap = self.heap.lock();

        unsafe { block::decode(user).as_ref().used_size }
    }

    /// Biggest alignment accepted, the OS page size.
    pub fn max_alignment(&self) -> usize {
        self.heap.lock().pages.platform().page_size()
    }

    /// Number of octaves.
    pub fn base_entry_count(&self) -> usize {
        self.heap.lock().table.entry_count()
    }

    pub fn sub_index_count(&self) -> usize {
        match self.heap.lock().table.is_initialized() {
            true => self.config.sub_index_count,
            false => 0,
        }
    }

    /// Block size of the pool `(base, sub)`, zero if there is no such pool.
    pub fn block_size(&self, base: usize, sub: usize) -> usize {
        self.heap.lock().table.pool(base, sub).map_or(0, |pool| pool.block_size())
    }

    /// Blocks that one pool block of `(base, sub)` is meant to hold. Blocks
    /// bigger than the pool block size get a pool block each.
    pub fn block_count(&self, base: usize, sub: usize) -> usize {
        let heap = self.heap.lock();
        let pool_block_size = heap.table.pool_block_size();

        match heap.table.pool(base, sub).map(|pool| pool.block_size()) {
            Some(size) if size > pool_block_size => 1,
            Some(size) => pool_block_size / (size + BLOCK_HEADER_SIZE + HEADER_OFFSET_SIZE),
            None => 0,
        }
    }

    /// Pool blocks alive in the pool `(base, sub)`.
    pub fn pool_block_count(&self, base: usize, sub: usize) -> usize {
        self.heap.lock().table.pool(base, sub).map_or(0, |pool| pool.pool_block_count())
    }

    /// Free blocks over every pool block of `(base, sub)`.
    pub fn free_block_count(&self, base: usize, sub: usize) -> usize {
        self.heap.lock().table.pool(base, sub).map_or(0, |pool| pool.total_free())
    }

    /// Pool that serves `malloc(size, 0)`.
    pub fn bucket_of(&self, size: usize) -> Option<(usize, usize)> {
        let heap = self.heap.lock();

        if size == 0 || !heap.is_initialized() {
            return None;
        }

        heap.table.bucket(adjusted_size(size, DEFAULT_ALIGNMENT)?).ok()
    }

    pub fn max_pool_block_size(&self) -> usize {
        self.heap.lock().table.pool_block_size()
    }

    pub fn stats(&self) -> MallocStats {
        self.heap.lock().stats()
    }
}

impl<P: PlatformMemory> Drop for MallocScaled<P> {
    fn drop(&mut self) {
        self.heap.get_mut().shutdown();
    }
}

unsafe impl<P: PlatformMemory + Send> GlobalAlloc for MallocScaled<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.heap.lock();

        if !heap.is_initialized() {
            if let Err(err) = heap.init(&self.config) {
                report("lazy init", err);
                return ptr::null_mut();
            }
        }

        match heap.malloc(layout.size(), layout.align()) {
            Ok(user) => user.as_ptr(),
            Err(err) => {
                report("alloc", err);
                ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { MallocScaled::realloc(self, ptr, new_size, layout.align()) }
    }
}
