use crate::{
    error::AllocError,
    freelist::FreeRuns,
    kernel::{MemoryBlock, PlatformMemory},
    list::Links,
    slots::Slots,
    utils::{align_down, checked_align, floor_log2, is_aligned},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Allocated,
    #[default]
    Released,
}

/// Page-granular piece of an [`Arena`].
///
/// Runs tile the arena exactly. Every run knows its physical neighbours, so
/// any two adjacent released runs can be merged no matter their sizes:
///
/// ```text
///            lower                       upper
///   +----------------+---------------+----------------+
///   |   Run (64K)    |  Run (192K)   |   Run (128K)   |
///   +----------------+---------------+----------------+
///   ^ arena base                                      ^ arena end
/// ```
///
/// A run is stored in the run table at the index of its first arena page.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Run {
    pub addr: usize,
    pub size: usize,
    pub state: RunState,
    /// Run right after this one in memory.
    pub upper: Option<u32>,
    /// Run right before this one in memory.
    pub lower: Option<u32>,
    pub links: Links,
}

/// One big virtual memory reservation subdivided into arena pages.
///
/// The run table lives in its own committed reservation, one record per arena
/// page, so the arena memory itself only ever holds user data.
pub(crate) struct Arena {
    region: MemoryBlock,
    runs_block: MemoryBlock,
    runs: Slots<Run>,
    free_runs: FreeRuns,
    /// Bytes not covered by allocated runs.
    rest_free: usize,
    /// Allocated runs.
    user_count: usize,
    page_size: usize,
    page_shift: usize,
}

impl Arena {
    /// Reserves and commits `size` bytes (a multiple of `page_size`) plus the
    /// run table, and starts with a single released run covering everything.
    ///
    /// **SAFETY**: the arena must be released through the same `platform`.
    pub unsafe fn new<P: PlatformMemory>(platform: &P, size: usize, page_size: usize) -> Result<Self, AllocError> {
        if size == 0 || !is_aligned(size, page_size) {
            return Err(AllocError::InvalidConfig("arena size must be a multiple of the arena page size"));
        }

        let page_count = size / page_size;
        if page_count > u32::MAX as usize {
            return Err(AllocError::InvalidConfig("arena has too many pages"));
        }

        unsafe {
            let runs_block = platform
                .reserve_committed(Slots::<Run>::bytes_for(page_count))
                .ok_or(AllocError::OutOfMemory)?;

            let Some(region) = platform.reserve_committed(size) else {
                platform.release(runs_block);
                return Err(AllocError::OutOfMemory);
            };

            let Some(mut runs) = Slots::<Run>::carve(runs_block, page_count) else {
                platform.release(region);
                platform.release(runs_block);
                return Err(AllocError::OutOfMemory);
            };

            runs[0] = Run {
                addr: region.addr(),
                size: region.size(),
                ..Default::default()
            };

            let mut free_runs = FreeRuns::new();
            free_runs.insert(&mut runs, 0);

            Ok(Self {
                region,
                runs_block,
                runs,
                free_runs,
                rest_free: region.size(),
                user_count: 0,
                page_size,
                page_shift: floor_log2(page_size),
            })
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.region.addr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.region.contains(addr)
    }

    /// No run of this arena is allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.user_count == 0
    }

    #[inline]
    #[cfg(test)]
    pub fn rest_free(&self) -> usize {
        self.rest_free
    }

    /// Carves the first released run big enough for `size` bytes rounded up
    /// to the arena page size.
    pub fn try_allocate(&mut self, size: usize) -> Option<MemoryBlock> {
        if size == 0 || size > self.rest_free {
            return None;
        }

        let aligned = checked_align(size, self.page_size)?;
        let index = self.free_runs.find_fit(&self.runs, aligned)?;

        Some(self.take(index, aligned))
    }

    /// Carves the arena pages covering `[addr, addr + size)`. Arena pages are
    /// counted from the arena base, which only has OS page alignment. The
    /// returned block starts at the arena page holding `addr`.
    pub fn try_allocate_at(&mut self, addr: usize, size: usize) -> Option<MemoryBlock> {
        if size == 0 || !self.contains(addr) {
            return None;
        }

        let offset = addr - self.base();
        let start = self.base() + align_down(offset, self.page_size);
        let end = self.base().checked_add(checked_align(offset.checked_add(size)?, self.page_size)?)?;
        let aligned = end - start;

        if aligned > self.rest_free || end > self.region.end() {
            return None;
        }

        let index = self.free_runs.find_containing(&self.runs, start, aligned)?;
        let lead = start - self.runs[index as usize].addr;

        let user = match lead {
            0 => index,
            lead => self.split(index, lead)?,
        };

        Some(self.take(user, aligned))
    }

    /// Releases the allocated run that starts at the arena page of `addr`.
    /// Returns the size of the released run.
    pub fn try_free(&mut self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }

        let index = ((addr - self.base()) >> self.page_shift) as u32;
        let start = self.base() + ((index as usize) << self.page_shift);
        let run = &mut self.runs[index as usize];

        if run.state != RunState::Allocated || run.addr != start {
            return None;
        }

        run.state = RunState::Released;
        let size = run.size;

        self.rest_free += size;
        self.user_count -= 1;
        self.free_runs.insert(&mut self.runs, index);
        self.merge(index);

        Some(size)
    }

    /// Splits the released run `index` so that it keeps `at` bytes. The rest
    /// becomes a new released run right above it, which is returned.
    fn split(&mut self, index: u32, at: usize) -> Option<u32> {
        let parent = self.runs[index as usize];

        if at == 0 || parent.size <= at {
            return None;
        }

        let rest = index + (at >> self.page_shift) as u32;

        self.runs[rest as usize] = Run {
            addr: parent.addr + at,
            size: parent.size - at,
            state: RunState::Released,
            upper: parent.upper,
            lower: Some(index),
            links: Links::default(),
        };

        if let Some(upper) = parent.upper {
            self.runs[upper as usize].lower = Some(rest);
        }

        let parent = &mut self.runs[index as usize];
        parent.upper = Some(rest);
        parent.size = at;

        self.free_runs.insert(&mut self.runs, rest);

        Some(rest)
    }

    /// Marks the released run `index` as allocated, splitting off whatever is
    /// left past `size`.
    fn take(&mut self, index: u32, size: usize) -> MemoryBlock {
        self.split(index, size);

        self.free_runs.remove(&mut self.runs, index);
        self.runs[index as usize].state = RunState::Allocated;

        self.user_count += 1;
        self.rest_free -= size;

        MemoryBlock::new(self.runs[index as usize].addr as *mut u8, size)
    }

    /// Tries to merge the freshly released run `index` with its upper and then
    /// with its lower neighbour. Absorbed runs leave both the free list and the
    /// adjacency chain.
    fn merge(&mut self, index: u32) {
        let run = self.runs[index as usize];

        if let Some(upper_index) = run.upper {
            let upper = self.runs[upper_index as usize];

            if upper.state == RunState::Released {
                self.free_runs.remove(&mut self.runs, upper_index);

                if let Some(next) = upper.upper {
                    self.runs[next as usize].lower = Some(index);
                }

                let run = &mut self.runs[index as usize];
                run.upper = upper.upper;
                run.size += upper.size;

                self.runs[upper_index as usize] = Run::default();
            }
        }

        let run = self.runs[index as usize];

        if let Some(lower_index) = run.lower {
            if self.runs[lower_index as usize].state == RunState::Released {
                self.free_runs.remove(&mut self.runs, index);

                if let Some(next) = run.upper {
                    self.runs[next as usize].lower = Some(lower_index);
                }

                let lower = &mut self.runs[lower_index as usize];
                lower.upper = run.upper;
                lower.size += run.size;

                self.runs[index as usize] = Run::default();
            }
        }
    }

    /// `(addr, size)` of every released run, in free list order.
    #[cfg(test)]
    pub fn free_runs(&self) -> Vec<(usize, usize)> {
        self.free_runs
            .indices(&self.runs)
            .map(|index| (self.runs[index as usize].addr, self.runs[index as usize].size))
            .collect()
    }

    /// Returns the arena and its run table to the OS.
    ///
    /// On failure nothing is released and the arena stays usable.
    ///
    /// **SAFETY**: `platform` must be the one the arena was created with and no
    /// run of the arena may be used afterwards.
    pub unsafe fn release<P: PlatformMemory>(&mut self, platform: &P) -> bool {
        unsafe {
            if !platform.release(self.region) {
                return false;
            }

            if !platform.release(self.runs_block) {
                log::warn!("cannot release arena run table at {:p}", self.runs_block.base());
            }
        }

        self.free_runs.clear();
        self.region = MemoryBlock::empty();
        self.runs_block = MemoryBlock::empty();
        self.rest_free = 0;
        self.user_count = 0;

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, tracking::TrackingKernel};

    const PAGE: usize = 64 * 1024;

    /// One kernel whose reservations follow mmap and one whose reservations
    /// never start on the arena page grid.
    fn kernels() -> [TrackingKernel; 2] {
        [TrackingKernel::new(), TrackingKernel::shifted()]
    }

    fn arena(kernel: &TrackingKernel, pages: usize) -> Arena {
        unsafe { Arena::new(kernel, pages * PAGE, PAGE).unwrap() }
    }

    fn release(mut arena: Arena, kernel: &TrackingKernel) {
        unsafe { assert!(arena.release(kernel)) }
        assert_eq!(kernel.live(), 0);
    }

    #[test]
    fn starts_with_one_free_run() {
        for kernel in kernels() {
            let arena = arena(&kernel, 8);

            assert!(arena.is_empty());
            assert_eq!(arena.free_runs(), vec![(arena.base(), 8 * PAGE)]);

            release(arena, &kernel);
        }
    }

    #[test]
    fn shifted_base_is_off_the_page_grid() {
        let kernel = TrackingKernel::shifted();
        let mut arena = arena(&kernel, 4);
        let base = arena.base();

        assert_ne!(base % PAGE, 0);

        let block = arena.try_allocate(PAGE).unwrap();
        assert_eq!(block.addr(), base);

        // The first run starts below the closest 64K boundary above the base.
        assert_eq!(arena.try_free(block.addr() + PAGE - 1), Some(PAGE));
        assert!(arena.is_empty());

        release(arena, &kernel);
    }

    #[test]
    fn allocate_rounds_up_and_splits() {
        for kernel in kernels() {
            let mut arena = arena(&kernel, 8);
            let base = arena.base();

            let block = arena.try_allocate(PAGE + 1).unwrap();
            assert_eq!(block.addr(), base);
            assert_eq!(block.size(), 2 * PAGE);
            assert_eq!(arena.rest_free(), 6 * PAGE);
            assert_eq!(arena.free_runs(), vec![(base + 2 * PAGE, 6 * PAGE)]);

            // The memory is committed.
            unsafe {
                *block.base() = 1;
                *block.base().add(block.size() - 1) = 1;
            }

            assert!(arena.try_allocate(7 * PAGE).is_none());
            assert!(arena.try_allocate(0).is_none());

            release(arena, &kernel);
        }
    }

    #[test]
    fn merge_three_adjacent_runs() {
        // Freeing in any order must end up with a single run.
        let orders = [[0, 2, 1], [0, 1, 2], [2, 1, 0], [1, 0, 2]];

        for kernel in kernels() {
            for order in orders {
                let mut arena = arena(&kernel, 4);
                let base = arena.base();

                let blocks: Vec<_> = (0..3).map(|_| arena.try_allocate(PAGE).unwrap()).collect();
                for (i, block) in blocks.iter().enumerate() {
                    assert_eq!(block.addr(), base + i * PAGE);
                }

                for i in order {
                    assert_eq!(arena.try_free(blocks[i].addr()), Some(PAGE));
                }

                assert!(arena.is_empty());
                assert_eq!(arena.free_runs(), vec![(base, 4 * PAGE)]);

                release(arena, &kernel);
            }
        }
    }

    #[test]
    fn outer_runs_merge_through_inner_run() {
        for kernel in kernels() {
            let mut arena = arena(&kernel, 3);
            let base = arena.base();

            let a = arena.try_allocate(PAGE).unwrap();
            let b = arena.try_allocate(PAGE).unwrap();
            let c = arena.try_allocate(PAGE).unwrap();
            assert!(arena.free_runs().is_empty());

            arena.try_free(a.addr());
            arena.try_free(c.addr());
            assert_eq!(arena.free_runs().len(), 2);

            arena.try_free(b.addr());
            assert_eq!(arena.free_runs(), vec![(base, 3 * PAGE)]);

            release(arena, &kernel);
        }
    }

    #[test]
    fn free_requires_allocated_run_start() {
        for kernel in kernels() {
            let mut arena = arena(&kernel, 4);

            let block = arena.try_allocate(2 * PAGE).unwrap();

            assert_eq!(arena.try_free(block.addr() + PAGE), None);
            assert_eq!(arena.try_free(block.addr() + block.size()), None);
            assert_eq!(arena.try_free(0), None);
            assert_eq!(arena.try_free(block.addr() + 16), Some(2 * PAGE));
            // Double free.
            assert_eq!(arena.try_free(block.addr()), None);

            release(arena, &kernel);
        }
    }

    #[test]
    fn allocate_at_address() {
        for kernel in kernels() {
            let mut arena = arena(&kernel, 8);
            let base = arena.base();

            // Unaligned request straddling two arena pages.
            let block = arena.try_allocate_at(base + 3 * PAGE + 100, PAGE).unwrap();
            assert_eq!(block.addr(), base + 3 * PAGE);
            assert_eq!(block.size(), 2 * PAGE);
            assert_eq!(arena.free_runs(), vec![(base, 3 * PAGE), (base + 5 * PAGE, 3 * PAGE)]);

            // Overlaps the allocated run.
            assert!(arena.try_allocate_at(base + 4 * PAGE, PAGE).is_none());
            // Past the end of the arena.
            assert!(arena.try_allocate_at(base + 7 * PAGE, 2 * PAGE).is_none());

            let first = arena.try_allocate_at(base, PAGE).unwrap();
            assert_eq!(first.addr(), base);

            arena.try_free(block.addr());
            arena.try_free(first.addr());
            assert_eq!(arena.free_runs().len(), 1);
            assert_eq!(arena.rest_free(), 8 * PAGE);

            release(arena, &kernel);
        }
    }

    #[test]
    fn first_fit_reuses_freed_hole() {
        for kernel in kernels() {
            let mut arena = arena(&kernel, 8);

            let a = arena.try_allocate(2 * PAGE).unwrap();
            let _b = arena.try_allocate(6 * PAGE).unwrap();
            assert!(arena.try_allocate(PAGE).is_none());

            arena.try_free(a.addr());

            let c = arena.try_allocate(PAGE).unwrap();
            assert_eq!(c.addr(), a.addr());
            assert_eq!(arena.free_runs(), vec![(a.addr() + PAGE, PAGE)]);

            release(arena, &kernel);
        }
    }

    #[test]
    fn rejects_unaligned_size() {
        unsafe {
            assert!(matches!(Arena::new(&Kernel, PAGE + 1, PAGE), Err(AllocError::InvalidConfig(_))));
        }
    }
}
