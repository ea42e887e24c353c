//! Size classes. Every request size lands in one `(base, sub)` bucket: `base`
//! picks the power of two octave, `sub` one of the equal linear spans the
//! octave is divided into.
//!
//! ```text
//!  base 0   [0, 256]        | 32 | 32 | 32 | 32 | 32 | 32 | 32 | 32 |
//!  base 1   (256, 512]      | 32 | 32 | 32 | 32 | 32 | 32 | 32 | 32 |
//!  base 2   (512, 1024]     | 64 | 64 | 64 | 64 | 64 | 64 | 64 | 64 |
//!  ...
//! ```
//!
//! The block size of a bucket is the upper edge of its span, so every request
//! that maps to it fits.

use crate::{
    config::{Config, MAX_SUB_INDEX_COUNT},
    error::AllocError,
    kernel::PlatformMemory,
    page_alloc::PageAllocator,
    pool::{Pool, ReleasePolicy},
    slots::Slots,
    utils::{align, ceil_log2, floor_log2},
    vm_block::VmBlock,
};

/// Lower edge and span shift of the octave `index` (log2 of its upper edge).
#[inline]
const fn octave(index: usize, min_index: usize, sub_shift: usize) -> (usize, usize) {
    if index == min_index {
        (0, min_index - sub_shift)
    } else {
        (1 << (index - 1), index - 1 - sub_shift)
    }
}

/// Bucket of `size`. Sizes below the smallest octave land in base 0, sizes
/// above the biggest one have no bucket.
pub(crate) const fn bucket(size: usize, min_index: usize, max_index: usize, sub_shift: usize) -> Option<(usize, usize)> {
    let index = ceil_log2(size);

    let base = if index < min_index { 0 } else { index - min_index };
    if base > max_index - min_index {
        return None;
    }

    let (lower, shift) = octave(base + min_index, min_index, sub_shift);
    let sub = (size - lower) >> shift;
    let last = (1 << sub_shift) - 1;

    Some((base, if sub > last { last } else { sub }))
}

/// Block size of the bucket `(base, sub)`.
pub(crate) const fn block_size(base: usize, sub: usize, min_index: usize, sub_shift: usize) -> usize {
    let (lower, shift) = octave(base + min_index, min_index, sub_shift);

    lower + (1 << shift) * (sub + 1)
}

/// Every pool of one octave.
#[derive(Default)]
pub(crate) struct PoolTableEntry {
    pools: [Pool; MAX_SUB_INDEX_COUNT],
}

/// Owns every [`Pool`]. The entries live in a single run of the arena
/// allocator, one per octave.
pub(crate) struct PoolTable {
    vm: VmBlock,
    entries: Option<Slots<PoolTableEntry>>,
    min_index: usize,
    max_index: usize,
    sub_shift: usize,
    pool_block_size: usize,
    policy: ReleasePolicy,
}

impl PoolTable {
    pub const fn new() -> Self {
        Self {
            vm: VmBlock::empty(),
            entries: None,
            min_index: 0,
            max_index: 0,
            sub_shift: 0,
            pool_block_size: 0,
            policy: ReleasePolicy {
                threshold_percent: 150,
                promote_on_free: true,
            },
        }
    }

    /// Allocates the entries and sets the block size of every pool. The
    /// config must have been validated.
    pub fn init<P: PlatformMemory>(&mut self, pages: &mut PageAllocator<P>, config: &Config) -> Result<(), AllocError> {
        if self.entries.is_some() {
            return Err(AllocError::AlreadyInitialized);
        }

        let min_index = floor_log2(config.min_base_block_size);
        let max_index = floor_log2(config.max_base_block_size);
        let sub_shift = floor_log2(config.sub_index_count);
        let count = max_index - min_index + 1;

        let bytes = align(Slots::<PoolTableEntry>::bytes_for(count), pages.page_size());
        let vm = VmBlock::allocate(pages, bytes)?;

        let Some(mut entries) = (unsafe { Slots::<PoolTableEntry>::carve(vm.block(), count) }) else {
            vm.free(pages);
            return Err(AllocError::OutOfMemory);
        };

        for (base, entry) in entries.iter_mut().enumerate() {
            for (sub, pool) in entry.pools[..config.sub_index_count].iter_mut().enumerate() {
                pool.init(block_size(base, sub, min_index, sub_shift), config.pool_block_size);
            }
        }

        self.vm = vm;
        self.entries = Some(entries);
        self.min_index = min_index;
        self.max_index = max_index;
        self.sub_shift = sub_shift;
        self.pool_block_size = config.pool_block_size;
        self.policy = ReleasePolicy {
            threshold_percent: config.release_threshold_percent,
            promote_on_free: config.promote_on_free,
        };

        log::debug!(
            "pool table ready: {count} octaves of {} pools, blocks from {} to {} bytes",
            config.sub_index_count,
            block_size(0, 0, min_index, sub_shift),
            1usize << max_index
        );

        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.entries.is_some()
    }

    /// Bucket of `adjusted_size`.
    pub fn bucket(&self, adjusted_size: usize) -> Result<(usize, usize), AllocError> {
        bucket(adjusted_size, self.min_index, self.max_index, self.sub_shift).ok_or(AllocError::SizeOutOfRange(adjusted_size))
    }

    pub fn pool(&self, base: usize, sub: usize) -> Option<&Pool> {
        match sub < self.sub_index_count() {
            true => self.entries.as_ref()?.get(base).map(|entry| &entry.pools[sub]),
            false => None,
        }
    }

    pub fn pool_mut(&mut self, base: usize, sub: usize) -> Option<&mut Pool> {
        match sub < self.sub_index_count() {
            true => self.entries.as_mut()?.get_mut(base).map(|entry| &mut entry.pools[sub]),
            false => None,
        }
    }

    /// Pool whose blocks are exactly `block_size` bytes. A block size is the
    /// upper edge of its span, so it is looked up one byte below.
    pub fn owner_mut(&mut self, block_size: usize) -> Option<&mut Pool> {
        let (base, sub) = bucket(block_size.checked_sub(1)?, self.min_index, self.max_index, self.sub_shift)?;

        self.pool_mut(base, sub).filter(|pool| pool.block_size() == block_size)
    }

    /// Every pool in `(base, sub)` order.
    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        let sub_count = self.sub_index_count();

        self.entries
            .iter()
            .flat_map(|entries| entries.iter())
            .flat_map(move |entry| entry.pools[..sub_count].iter())
    }

    #[inline]
    pub fn policy(&self) -> ReleasePolicy {
        self.policy
    }

    pub fn entry_count(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.len())
    }

    #[inline]
    pub fn sub_index_count(&self) -> usize {
        1 << self.sub_shift
    }

    #[inline]
    pub fn pool_block_size(&self) -> usize {
        self.pool_block_size
    }

    /// Destroys every pool block and gives the entries back.
    pub fn release<P: PlatformMemory>(&mut self, pages: &mut PageAllocator<P>) {
        let Some(mut entries) = self.entries.take() else {
            return;
        };

        for entry in entries.iter_mut() {
            for pool in entry.pools.iter_mut() {
                pool.release(pages);
            }
        }

        self.vm.free(pages);
        self.vm = VmBlock::empty();
    }
}
