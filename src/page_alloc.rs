//! Arena allocator. Hands out page aligned runs of memory carved out of a
//! fixed number of big virtual memory reservations (arenas).
//!
//! ```text
//!   arena table                  arenas
//! +-------------+      +---------------------------------+
//! | Some(Arena) | ---> | run | run | ...            run  |
//! +-------------+      +---------------------------------+
//! |    None     |
//! +-------------+      +-------------------------+
//! | Some(Arena) | ---> | run | ...          run  |
//! +-------------+      +-------------------------+
//! |     ...     |
//! ```

use crate::{
    arena::Arena,
    config::Config,
    error::AllocError,
    kernel::{Access, MemoryBlock, PlatformMemory},
    slots::Slots,
    stats::PageStats,
    utils::checked_align,
};

/// Arena allocator built on top of a [`PlatformMemory`] provider.
///
/// Arenas are reserved lazily into a free slot of the arena table and given
/// back to the platform as soon as their last run is freed. Every method
/// reports failure through its return value.
pub struct PageAllocator<P> {
    platform: P,
    page_size: usize,
    arena_page_size: usize,
    arena_min_size: usize,
    table_block: MemoryBlock,
    table: Option<Slots<Option<Arena>>>,
    stats: PageStats,
}

impl<P: PlatformMemory> PageAllocator<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            page_size: 0,
            arena_page_size: 0,
            arena_min_size: 0,
            table_block: MemoryBlock::empty(),
            table: None,
            stats: PageStats::EMPTY,
        }
    }

    /// Sets up the arena table. No arena is reserved yet.
    pub fn init(&mut self, config: &Config) -> Result<(), AllocError> {
        if self.table.is_some() {
            return Err(AllocError::AlreadyInitialized);
        }

        let page_size = self.platform.page_size();

        if !crate::utils::is_pow2(config.arena_page_size) || config.arena_page_size % page_size != 0 {
            return Err(AllocError::InvalidConfig("arena page size is not a multiple of the page size"));
        }

        if config.max_arena_count == 0 {
            return Err(AllocError::InvalidConfig("max arena count is zero"));
        }

        unsafe {
            let bytes = Slots::<Option<Arena>>::bytes_for(config.max_arena_count);
            let block = self.platform.reserve_committed(bytes).ok_or(AllocError::OutOfMemory)?;

            let Some(table) = Slots::carve(block, config.max_arena_count) else {
                self.platform.release(block);
                return Err(AllocError::OutOfMemory);
            };

            self.table_block = block;
            self.table = Some(table);
        }

        self.page_size = page_size;
        self.arena_page_size = config.arena_page_size;
        self.arena_min_size = config.arena_min_size;
        self.stats = PageStats::default();

        log::debug!(
            "page allocator ready: {} arena slots, arena page {} bytes, page {} bytes",
            config.max_arena_count,
            self.arena_page_size,
            self.page_size
        );

        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    /// Reserves a new arena of at least `size` bytes, never smaller than the
    /// configured arena min size. Returns the whole arena.
    pub fn reserve(&mut self, size: usize) -> Result<MemoryBlock, AllocError> {
        self.stats.reserve_requests += 1;

        let result = self.try_reserve(size);
        if result.is_err() {
            self.stats.failed_reserve_requests += 1;
        }

        result
    }

    fn try_reserve(&mut self, size: usize) -> Result<MemoryBlock, AllocError> {
        let table = self.table.as_mut().ok_or(AllocError::NotInitialized)?;

        let slot = table.iter().position(Option::is_none).ok_or(AllocError::OutOfMemory)?;
        let aligned = checked_align(size, self.arena_page_size).ok_or(AllocError::OutOfMemory)?;
        let arena_size = checked_align(aligned.max(self.arena_min_size), self.arena_page_size)
            .ok_or(AllocError::OutOfMemory)?;

        let arena = unsafe { Arena::new(&self.platform, arena_size, self.arena_page_size)? };
        let block = MemoryBlock::new(arena.base() as *mut u8, arena.size());
        table[slot] = Some(arena);

        self.stats.arena_count += 1;
        self.stats.reserved += block.size();
        self.stats.max_arena_size = self.stats.max_arena_size.max(block.size());

        log::debug!("arena {slot} reserved at {:p}, {} bytes", block.base(), block.size());

        Ok(block)
    }

    /// Carves `size` bytes, rounded up to the arena page size, from the first
    /// arena that has a released run big enough.
    pub fn allocate(&mut self, size: usize) -> Result<MemoryBlock, AllocError> {
        self.count_alloc(size, |arena| arena.try_allocate(size))
    }

    /// Same as [`PageAllocator::allocate`] restricted to the arena starting at
    /// `arena_base`.
    pub fn allocate_in(&mut self, arena_base: usize, size: usize) -> Result<MemoryBlock, AllocError> {
        self.count_alloc(size, |arena| match arena.base() == arena_base {
            true => arena.try_allocate(size),
            false => None,
        })
    }

    /// Carves the arena pages covering `[address, address + size)` out of the
    /// arena that contains `address`.
    pub fn allocate_at(&mut self, address: usize, size: usize) -> Result<MemoryBlock, AllocError> {
        self.count_alloc(size, |arena| match arena.contains(address) {
            true => arena.try_allocate_at(address, size),
            false => None,
        })
    }

    fn count_alloc<F>(&mut self, size: usize, mut carve: F) -> Result<MemoryBlock, AllocError>
    where
        F: FnMut(&mut Arena) -> Option<MemoryBlock>,
    {
        self.stats.alloc_requests += 1;

        let table = self.table.as_mut().ok_or(AllocError::NotInitialized)?;
        let found = table.iter_mut().flatten().find_map(|arena| carve(arena));

        match found {
            Some(block) => {
                self.stats.used += block.size();
                self.stats.max_alloc_request = self.stats.max_alloc_request.max(size);
                log::trace!("page run of {} bytes at {:p}", block.size(), block.base());
                Ok(block)
            }
            None => {
                self.stats.failed_alloc_requests += 1;
                Err(AllocError::OutOfMemory)
            }
        }
    }

    /// Frees the run starting at `block.base()`. The arena is handed back to
    /// the platform when it becomes empty.
    pub fn free(&mut self, block: MemoryBlock) -> bool {
        self.stats.free_requests += 1;

        let Some(table) = self.table.as_mut() else {
            self.stats.failed_free_requests += 1;
            return false;
        };

        let addr = block.addr();
        let owner = table
            .iter()
            .position(|entry| entry.as_ref().is_some_and(|arena| arena.contains(addr)));

        let Some(slot) = owner else {
            self.stats.failed_free_requests += 1;
            return false;
        };

        let entry = &mut table[slot];
        let Some(arena) = entry.as_mut() else {
            return false;
        };

        let Some(size) = arena.try_free(addr) else {
            self.stats.failed_free_requests += 1;
            return false;
        };

        self.stats.used -= size;

        if arena.is_empty() {
            let (base, arena_size) = (arena.base(), arena.size());

            if unsafe { arena.release(&self.platform) } {
                *entry = None;
                self.stats.arena_count -= 1;
                self.stats.reserved -= arena_size;
                log::debug!("arena {slot} at {base:#x} released");
            } else {
                log::warn!("cannot release arena at {base:#x} back to the OS, possible lack of memory");
            }
        }

        true
    }

    /// Changes the page protection of `block`.
    pub fn set_protection(&self, block: MemoryBlock, access: Access) -> bool {
        let inside = self
            .table
            .as_ref()
            .is_some_and(|table| table.iter().flatten().any(|arena| arena.contains(block.addr())));

        inside && unsafe { self.platform.protect(block, access) }
    }

    pub fn is_protection_supported(&self) -> bool {
        self.platform.is_protection_supported()
    }

    /// Size every run is rounded up to.
    #[inline]
    pub fn granularity(&self) -> usize {
        self.arena_page_size
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn arena_count(&self) -> usize {
        self.stats.arena_count
    }

    pub fn stats(&self) -> PageStats {
        self.stats
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Gives every arena and the arena table back to the platform. Runs that
    /// are still allocated become invalid.
    pub fn release(&mut self) -> bool {
        let Some(mut table) = self.table.take() else {
            return true;
        };

        let mut ok = true;

        for entry in table.iter_mut() {
            if let Some(arena) = entry.as_mut() {
                if unsafe { arena.release(&self.platform) } {
                    *entry = None;
                } else {
                    log::warn!("cannot release arena at {:#x} back to the OS", arena.base());
                    ok = false;
                }
            }
        }

        if ok {
            ok = unsafe { self.platform.release(self.table_block) };
            self.table_block = MemoryBlock::empty();
        } else {
            // Keep the table around so the leftovers stay reachable.
            self.table = Some(table);
        }

        if ok {
            self.stats = PageStats::default();
            log::debug!("page allocator released");
        }

        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, tracking::TrackingKernel};

    const PAGE: usize = 64 * 1024;

    fn config() -> Config {
        Config::new().with_arena_min_size(16 * PAGE).with_max_arena_count(4)
    }

    fn pages<P: PlatformMemory>(platform: P) -> PageAllocator<P> {
        let mut pages = PageAllocator::new(platform);
        pages.init(&config()).unwrap();
        pages
    }

    #[test]
    fn allocate_needs_reserved_arena() {
        let mut pages = pages(Kernel);

        assert_eq!(pages.allocate(PAGE), Err(AllocError::OutOfMemory));

        let arena = pages.reserve(PAGE).unwrap();
        assert_eq!(arena.size(), 16 * PAGE);

        let block = pages.allocate(PAGE + 1).unwrap();
        assert_eq!(block.addr(), arena.addr());
        assert_eq!(block.size(), 2 * PAGE);
        assert_eq!(pages.stats().used, 2 * PAGE);
        assert_eq!(pages.stats().failed_alloc_requests, 1);

        assert!(pages.release());
    }

    #[test]
    fn empty_arena_goes_back_to_the_os() {
        for kernel in [TrackingKernel::new(), TrackingKernel::shifted()] {
            let mut pages = pages(&kernel);
            let baseline = kernel.live();

            pages.reserve(PAGE).unwrap();
            // Arena region plus its run table.
            assert_eq!(kernel.live(), baseline + 2);

            let a = pages.allocate(PAGE).unwrap();
            let b = pages.allocate(PAGE).unwrap();

            assert!(pages.free(a));
            assert_eq!(pages.arena_count(), 1);

            assert!(pages.free(b));
            assert_eq!(pages.arena_count(), 0);
            assert_eq!(kernel.live(), baseline);

            // Not owned by any arena anymore.
            assert!(!pages.free(b));
            assert_eq!(pages.stats().failed_free_requests, 1);

            assert!(pages.release());
            assert_eq!(kernel.live(), 0);
        }
    }

    #[test]
    fn big_reservations_fit_exactly() {
        let mut pages = pages(Kernel);

        let arena = pages.reserve(20 * PAGE + 5).unwrap();
        assert_eq!(arena.size(), 21 * PAGE);

        let block = pages.allocate(21 * PAGE).unwrap();
        assert_eq!(block.addr(), arena.addr());

        assert!(pages.free(block));
        assert!(pages.release());
    }

    #[test]
    fn allocate_in_and_at() {
        for kernel in [TrackingKernel::new(), TrackingKernel::shifted()] {
            let mut pages = pages(&kernel);

            let first = pages.reserve(PAGE).unwrap();
            let second = pages.reserve(PAGE).unwrap();
            assert_eq!(pages.arena_count(), 2);

            let block = pages.allocate_in(second.addr(), PAGE).unwrap();
            assert!(second.contains(block.addr()));

            let at = pages.allocate_at(first.addr() + 4 * PAGE, PAGE).unwrap();
            assert_eq!(at.addr(), first.addr() + 4 * PAGE);

            assert_eq!(pages.allocate_at(first.addr() + 4 * PAGE, PAGE), Err(AllocError::OutOfMemory));
            assert_eq!(pages.allocate_in(12345, PAGE), Err(AllocError::OutOfMemory));

            assert!(pages.set_protection(at, Access::ReadOnly));
            assert!(pages.set_protection(at, Access::ReadWrite));
            assert!(!pages.set_protection(MemoryBlock::new(std::ptr::null_mut(), PAGE), Access::ReadOnly));

            assert!(pages.free(at));
            assert!(pages.free(block));
            assert_eq!(pages.stats().failed_free_requests, 0);

            assert!(pages.release());
            assert_eq!(kernel.live(), 0);
        }
    }

    #[test]
    fn arena_table_is_bounded() {
        let mut pages = pages(Kernel);

        for _ in 0..4 {
            pages.reserve(PAGE).unwrap();
        }

        assert_eq!(pages.reserve(PAGE), Err(AllocError::OutOfMemory));
        assert_eq!(pages.stats().failed_reserve_requests, 1);

        assert!(pages.release());
        assert_eq!(pages.stats(), PageStats::default());
    }

    #[test]
    fn refused_reservation_is_out_of_memory() {
        let kernel = TrackingKernel::with_budget(1);
        let mut pages = pages(&kernel);

        assert_eq!(pages.reserve(PAGE), Err(AllocError::OutOfMemory));
        assert_eq!(pages.arena_count(), 0);

        assert!(pages.release());
    }

    #[test]
    fn uninitialized_allocator_refuses_everything() {
        let mut pages = PageAllocator::new(Kernel);

        assert_eq!(pages.reserve(PAGE), Err(AllocError::NotInitialized));
        assert_eq!(pages.allocate(PAGE), Err(AllocError::NotInitialized));
        assert!(!pages.free(MemoryBlock::empty()));
        assert!(pages.release());
    }
}
