use crate::{
    error::AllocError,
    kernel::{MemoryBlock, PlatformMemory},
    page_alloc::PageAllocator,
};

/// One contiguous run of memory owned by a pool block or by the pool table.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct VmBlock {
    block: MemoryBlock,
}

impl VmBlock {
    pub const fn empty() -> Self {
        Self { block: MemoryBlock::empty() }
    }

    /// Gets `size` bytes from the arena allocator, reserving a new arena when
    /// none of the existing ones has room.
    pub fn allocate<P: PlatformMemory>(pages: &mut PageAllocator<P>, size: usize) -> Result<Self, AllocError> {
        let block = match pages.allocate(size) {
            Ok(block) => block,
            Err(AllocError::OutOfMemory) => {
                pages.reserve(size)?;
                pages.allocate(size)?
            }
            Err(err) => return Err(err),
        };

        Ok(Self { block })
    }

    /// Gives the memory back to the arena allocator.
    pub fn free<P: PlatformMemory>(self, pages: &mut PageAllocator<P>) {
        if !pages.free(self.block) {
            log::warn!(
                "cannot release block at {:p} of {} bytes, possible lack of memory",
                self.block.base(),
                self.block.size()
            );
        }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.block.base()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.block.size()
    }

    #[inline]
    pub fn block(&self) -> MemoryBlock {
        self.block
    }
}
