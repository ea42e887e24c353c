use std::{mem, ptr::NonNull};

use crate::{
    block::{BLOCK_HEADER_SIZE, BlockHeader, HEADER_OFFSET_SIZE, NIL},
    error::AllocError,
    kernel::PlatformMemory,
    list::{List, Node},
    page_alloc::PageAllocator,
    utils::align,
    vm_block::VmBlock,
};

/// Space taken by the pool block header at the start of its reservation.
pub(crate) const POOL_BLOCK_HEADER_SIZE: usize = align(mem::size_of::<Node<PoolBlock>>(), 16);

/// One reservation split in equal slots for a single size class.
///
/// The header is written at the very beginning of the reservation it
/// describes, as a [`Node`] of the [`List`] of its pool:
///
/// ```text
/// +-----------------+---------------------+---------------------+-----+
/// | Node<PoolBlock> | BlockHeader | data  | BlockHeader | data  | ... |
/// +-----------------+---------------------+---------------------+-----+
///                   ^ slot 0              ^ slot 1     (active_blocks)
/// ```
///
/// Slots past `active` have never been touched. Free slots form a LIFO list
/// threaded through [`BlockHeader::next_free`].
pub(crate) struct PoolBlock {
    /// Slots that fit in the reservation.
    pub total: usize,
    pub free: usize,
    /// Slots carved so far.
    pub active: usize,
    free_head: u32,
    first_slot: NonNull<u8>,
    stride: usize,
    vm: VmBlock,
}

impl PoolBlock {
    #[inline]
    fn header(&self, slot: u32) -> NonNull<BlockHeader> {
        debug_assert!((slot as usize) < self.active);

        unsafe { self.first_slot.add(slot as usize * self.stride).cast() }
    }

    /// Pops the free list or carves the next untouched slot.
    ///
    /// **SAFETY**: `node` must be the node holding `self`.
    unsafe fn take(&mut self, node: NonNull<Node<PoolBlock>>, block_size: usize) -> Result<NonNull<BlockHeader>, AllocError> {
        if self.free_head != NIL {
            let mut header = self.header(self.free_head);
            unsafe {
                self.free_head = header.as_ref().next_free;
                header.as_mut().next_free = NIL;
            }
            self.free -= 1;
            return Ok(header);
        }

        if self.active == self.total {
            return Err(AllocError::CorruptedPool(node.as_ptr() as usize));
        }

        let slot = self.active as u32;
        self.active += 1;

        let header = self.header(slot);
        unsafe {
            header.write(BlockHeader {
                used_size: 0,
                block_size,
                pool_block: node,
                slot,
                next_free: NIL,
            });
        }
        self.free -= 1;

        Ok(header)
    }

    /// **SAFETY**: `header` must be a slot of this pool block that is in use.
    unsafe fn give_back(&mut self, mut header: NonNull<BlockHeader>) {
        unsafe {
            let header = header.as_mut();
            header.used_size = 0;
            header.next_free = self.free_head;
            self.free_head = header.slot;
        }
        self.free += 1;
    }

    #[inline]
    pub fn is_fully_free(&self) -> bool {
        self.free == self.total
    }
}

/// Heuristics deciding when pool blocks die and which one serves next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReleasePolicy {
    pub threshold_percent: usize,
    pub promote_on_free: bool,
}

/// All the blocks of one size class.
///
/// New blocks always come from the head pool block. It is replaced by a new
/// pool block when it runs out, and optionally by whichever pool block gets
/// more free slots than it on free.
#[derive(Default)]
pub(crate) struct Pool {
    block_size: usize,
    pool_block_size: usize,
    blocks: List<PoolBlock>,
    head: Option<NonNull<Node<PoolBlock>>>,
    total_free: usize,
    memory: usize,
}

impl Pool {
    pub fn init(&mut self, block_size: usize, pool_block_size: usize) {
        self.block_size = block_size;
        self.pool_block_size = pool_block_size;
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn pool_block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Free slots over every pool block.
    #[inline]
    pub fn total_free(&self) -> usize {
        self.total_free
    }

    /// Slots over every pool block, free or not.
    #[cfg(test)]
    pub fn block_count(&self) -> usize {
        self.blocks.nodes().map(|node| unsafe { node.as_ref().data.total }).sum()
    }

    /// Bytes reserved by the pool blocks.
    #[inline]
    pub fn memory(&self) -> usize {
        self.memory
    }

    #[cfg(test)]
    pub fn head(&self) -> Option<NonNull<Node<PoolBlock>>> {
        self.head
    }

    /// Hands out a block for `used_size` bytes, adding a pool block when the
    /// head one is exhausted.
    pub fn get_free_block<P: PlatformMemory>(
        &mut self,
        pages: &mut PageAllocator<P>,
        used_size: usize,
    ) -> Result<NonNull<BlockHeader>, AllocError> {
        let head = match self.head {
            Some(head) if unsafe { head.as_ref().data.free } > 0 => head,
            _ => self.add_pool_block(pages)?,
        };

        let mut header = unsafe { (*head.as_ptr()).data.take(head, self.block_size)? };

        unsafe { header.as_mut().used_size = used_size };
        self.total_free -= 1;

        Ok(header)
    }

    /// Takes a block back. A pool block that ends up completely free is
    /// destroyed if the pool has plenty of free slots elsewhere.
    ///
    /// **SAFETY**: `header` must have been returned by
    /// [`Pool::get_free_block`] of this pool and not freed since.
    pub unsafe fn free_user_block<P: PlatformMemory>(
        &mut self,
        pages: &mut PageAllocator<P>,
        header: NonNull<BlockHeader>,
        policy: ReleasePolicy,
    ) {
        let node = unsafe { header.as_ref().pool_block };
        let block = unsafe { &mut (*node.as_ptr()).data };

        unsafe { block.give_back(header) };
        self.total_free += 1;

        let (free, fully_free) = (block.free, block.is_fully_free());

        if fully_free && self.total_free * 100 > free * policy.threshold_percent {
            let was_head = self.head == Some(node);

            self.delete_pool_block(pages, node);

            if was_head {
                self.head = self.most_free_block();
            }

            return;
        }

        if policy.promote_on_free {
            let head_free = self.head.map(|head| unsafe { head.as_ref().data.free });

            if head_free.is_none_or(|head_free| free > head_free) {
                self.head = Some(node);
            }
        }
    }

    fn add_pool_block<P: PlatformMemory>(&mut self, pages: &mut PageAllocator<P>) -> Result<NonNull<Node<PoolBlock>>, AllocError> {
        let stride = BLOCK_HEADER_SIZE + HEADER_OFFSET_SIZE + self.block_size;
        let big = self.block_size > self.pool_block_size;

        let vm_size = match big {
            true => align(POOL_BLOCK_HEADER_SIZE + stride, pages.page_size()),
            false => align(POOL_BLOCK_HEADER_SIZE + self.pool_block_size.max(stride), pages.page_size()),
        };

        let vm = VmBlock::allocate(pages, vm_size)?;

        let total = match big {
            true => 1,
            false => ((vm.size() - POOL_BLOCK_HEADER_SIZE) / stride).min(NIL as usize),
        };

        let Some(base) = NonNull::new(vm.base()) else {
            vm.free(pages);
            return Err(AllocError::OutOfMemory);
        };

        let block = PoolBlock {
            total,
            free: total,
            active: 0,
            free_head: NIL,
            first_slot: unsafe { base.add(POOL_BLOCK_HEADER_SIZE) },
            stride,
            vm,
        };

        let node = unsafe { self.blocks.append(block, base) };

        self.total_free += total;
        self.memory += vm.size();
        self.head = Some(node);

        log::debug!(
            "pool {}: pool block added at {:p}, {} blocks in {} bytes",
            self.block_size,
            base,
            total,
            vm.size()
        );

        Ok(node)
    }

    fn delete_pool_block<P: PlatformMemory>(&mut self, pages: &mut PageAllocator<P>, node: NonNull<Node<PoolBlock>>) {
        let (free, vm) = unsafe {
            let block = &node.as_ref().data;
            (block.free, block.vm)
        };

        unsafe { self.blocks.remove(node) };
        self.total_free -= free;
        self.memory -= vm.size();

        log::debug!("pool {}: pool block at {:p} deleted", self.block_size, vm.base());

        vm.free(pages);
    }

    /// The pool block with the most free slots, the first one on ties.
    fn most_free_block(&self) -> Option<NonNull<Node<PoolBlock>>> {
        let mut best: Option<(NonNull<Node<PoolBlock>>, usize)> = None;

        for node in self.blocks.nodes() {
            let free = unsafe { node.as_ref().data.free };

            if best.is_none_or(|(_, most)| free > most) {
                best = Some((node, free));
            }
        }

        best.map(|(node, _)| node)
    }

    /// Destroys every pool block, used or not.
    pub fn release<P: PlatformMemory>(&mut self, pages: &mut PageAllocator<P>) {
        while let Some(node) = self.blocks.first() {
            self.delete_pool_block(pages, node);
        }

        self.head = None;
        self.total_free = 0;
    }
}
