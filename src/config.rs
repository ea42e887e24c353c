use crate::{
    error::AllocError,
    utils::{is_aligned, is_pow2},
};

/// Alignment of every block handed out when the caller does not ask for one.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Upper bound of [`Config::sub_index_count`].
pub const MAX_SUB_INDEX_COUNT: usize = 16;

#[cfg(target_pointer_width = "64")]
const DEFAULT_MAX_BASE_BLOCK_SIZE: usize = 1 << 35;
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_MAX_BASE_BLOCK_SIZE: usize = 1 << 31;

/// Tuning of [`crate::MallocScaled`]. Checked once by [`Config::validate`]
/// when the allocator is initialized.
///
/// ```
/// use scaledalloc::Config;
///
/// const CONFIG: Config = Config::new()
///     .with_pool_block_size(1 << 20)
///     .with_arena_min_size(16 << 20);
///
/// assert_eq!(CONFIG.sub_index_count, 8);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Upper edge of the smallest octave. Power of two.
    pub min_base_block_size: usize,
    /// Upper edge of the biggest octave. Power of two.
    pub max_base_block_size: usize,
    /// Target size of the reservation backing one pool block.
    pub pool_block_size: usize,
    /// Linear buckets per octave. Power of two, at most [`MAX_SUB_INDEX_COUNT`].
    pub sub_index_count: usize,
    /// Granularity of the arena allocator. Multiple of the OS page size.
    pub arena_page_size: usize,
    /// Smallest arena ever reserved.
    pub arena_min_size: usize,
    /// Capacity of the arena table.
    pub max_arena_count: usize,
    /// A completely free pool block is destroyed once the free blocks of its
    /// pool exceed this percentage of its own free blocks.
    pub release_threshold_percent: usize,
    /// Make a pool block the head on free when it has more free blocks than
    /// the current head.
    pub promote_on_free: bool,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            min_base_block_size: 256,
            max_base_block_size: DEFAULT_MAX_BASE_BLOCK_SIZE,
            pool_block_size: 8 << 20,
            sub_index_count: 8,
            arena_page_size: 64 << 10,
            arena_min_size: 256 << 20,
            max_arena_count: 256,
            release_threshold_percent: 150,
            promote_on_free: true,
        }
    }

    pub const fn with_base_block_sizes(mut self, min: usize, max: usize) -> Self {
        self.min_base_block_size = min;
        self.max_base_block_size = max;
        self
    }

    pub const fn with_pool_block_size(mut self, size: usize) -> Self {
        self.pool_block_size = size;
        self
    }

    pub const fn with_sub_index_count(mut self, count: usize) -> Self {
        self.sub_index_count = count;
        self
    }

    pub const fn with_arena_page_size(mut self, size: usize) -> Self {
        self.arena_page_size = size;
        self
    }

    pub const fn with_arena_min_size(mut self, size: usize) -> Self {
        self.arena_min_size = size;
        self
    }

    pub const fn with_max_arena_count(mut self, count: usize) -> Self {
        self.max_arena_count = count;
        self
    }

    pub const fn with_release_threshold_percent(mut self, percent: usize) -> Self {
        self.release_threshold_percent = percent;
        self
    }

    pub const fn with_promote_on_free(mut self, promote: bool) -> Self {
        self.promote_on_free = promote;
        self
    }

    /// Checks every precondition against the OS `page_size`.
    pub fn validate(&self, page_size: usize) -> Result<(), AllocError> {
        let check = |ok: bool, reason: &'static str| if ok { Ok(()) } else { Err(AllocError::InvalidConfig(reason)) };

        check(is_pow2(self.min_base_block_size), "min base block size is not a power of two")?;
        check(is_pow2(self.max_base_block_size), "max base block size is not a power of two")?;
        check(
            self.min_base_block_size <= self.max_base_block_size,
            "min base block size is bigger than max base block size",
        )?;
        check(
            self.max_base_block_size <= 1 << (usize::BITS - 2),
            "max base block size does not fit in the address space",
        )?;
        check(
            is_pow2(self.sub_index_count) && self.sub_index_count <= MAX_SUB_INDEX_COUNT,
            "sub index count is not a power of two up to 16",
        )?;
        check(
            self.min_base_block_size / self.sub_index_count >= DEFAULT_ALIGNMENT,
            "smallest bucket span is below the default alignment",
        )?;
        check(
            self.pool_block_size > 0 && is_aligned(self.pool_block_size, DEFAULT_ALIGNMENT),
            "pool block size is not a multiple of the default alignment",
        )?;
        check(
            is_pow2(self.arena_page_size) && self.arena_page_size >= page_size,
            "arena page size is not a power of two multiple of the page size",
        )?;
        check(self.arena_min_size > 0, "arena min size is zero")?;
        check(self.max_arena_count > 0, "max arena count is zero")?;
        check(
            self.release_threshold_percent >= 100,
            "release threshold must be at least 100 percent",
        )?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(Config::new().validate(PAGE), Ok(()));
        assert_eq!(Config::default(), Config::new());
    }

    #[test]
    fn rejects_broken_configs() {
        let broken = [
            Config::new().with_base_block_sizes(300, 1 << 20),
            Config::new().with_base_block_sizes(1 << 20, 256),
            Config::new().with_sub_index_count(12),
            Config::new().with_sub_index_count(32),
            Config::new().with_base_block_sizes(64, 1 << 20),
            Config::new().with_pool_block_size(1000),
            Config::new().with_arena_page_size(1024),
            Config::new().with_arena_page_size(3 * PAGE),
            Config::new().with_max_arena_count(0),
            Config::new().with_release_threshold_percent(50),
        ];

        for config in broken {
            assert!(
                matches!(config.validate(PAGE), Err(AllocError::InvalidConfig(_))),
                "{config:?} should be rejected"
            );
        }
    }
}
