//! Usage bookkeeping. None of these counters has any effect on how memory is
//! handed out, they are only there to be looked at.

/// Counters of the arena allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    /// Arenas currently reserved.
    pub arena_count: usize,
    /// Bytes covered by the reserved arenas.
    pub reserved: usize,
    /// Bytes handed out as page runs.
    pub used: usize,
    pub reserve_requests: usize,
    pub failed_reserve_requests: usize,
    pub alloc_requests: usize,
    pub failed_alloc_requests: usize,
    pub free_requests: usize,
    pub failed_free_requests: usize,
    /// Biggest size ever requested from [`crate::PageAllocator::allocate`].
    pub max_alloc_request: usize,
    pub max_arena_size: usize,
}

/// Counters of the allocator facade.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MallocStats {
    pub malloc_requests: usize,
    pub realloc_requests: usize,
    pub free_requests: usize,
    pub failed_mallocs: usize,
    pub failed_reallocs: usize,
    /// Reallocations that had to move to another block.
    pub relocations: usize,
    /// Bytes requested by the live allocations.
    pub used: usize,
    pub peak_used: usize,
    /// Live allocations.
    pub used_blocks: usize,
    pub peak_used_blocks: usize,
    /// Bytes of virtual memory held by pool blocks.
    pub pool_memory: usize,
    /// Pool blocks currently alive.
    pub pool_blocks: usize,
    pub page: PageStats,
}

impl PageStats {
    pub(crate) const EMPTY: Self = Self {
        arena_count: 0,
        reserved: 0,
        used: 0,
        reserve_requests: 0,
        failed_reserve_requests: 0,
        alloc_requests: 0,
        failed_alloc_requests: 0,
        free_requests: 0,
        failed_free_requests: 0,
        max_alloc_request: 0,
        max_arena_size: 0,
    };
}

impl MallocStats {
    pub(crate) const EMPTY: Self = Self {
        malloc_requests: 0,
        realloc_requests: 0,
        free_requests: 0,
        failed_mallocs: 0,
        failed_reallocs: 0,
        relocations: 0,
        used: 0,
        peak_used: 0,
        used_blocks: 0,
        peak_used_blocks: 0,
        pool_memory: 0,
        pool_blocks: 0,
        page: PageStats::EMPTY,
    };

    pub(crate) fn on_alloc(&mut self, size: usize) {
        self.used += size;
        self.used_blocks += 1;
        self.peak_used = self.peak_used.max(self.used);
        self.peak_used_blocks = self.peak_used_blocks.max(self.used_blocks);
    }

    pub(crate) fn on_free(&mut self, size: usize) {
        self.used -= size;
        self.used_blocks -= 1;
    }

    /// A live allocation changed its size without moving to another block.
    pub(crate) fn on_resize(&mut self, old_size: usize, new_size: usize) {
        self.used = self.used - old_size + new_size;
        self.peak_used = self.peak_used.max(self.used);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peaks_survive_frees() {
        let mut stats = MallocStats::default();

        stats.on_alloc(100);
        stats.on_alloc(50);
        stats.on_free(100);
        stats.on_alloc(10);

        assert_eq!(stats.used, 60);
        assert_eq!(stats.used_blocks, 2);
        assert_eq!(stats.peak_used, 150);
        assert_eq!(stats.peak_used_blocks, 2);

        stats.on_resize(10, 200);
        assert_eq!(stats.used, 250);
        assert_eq!(stats.peak_used, 250);
        assert_eq!(stats.used_blocks, 2);
        assert_eq!(MallocStats::EMPTY, MallocStats::default());
    }
}
