use std::{mem, ptr::NonNull};

use crate::{list::Node, pool::PoolBlock, utils::align};

/// Header size of a block. Every slot of a pool block starts with one.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Size of the record that sits right before every user pointer.
pub(crate) const HEADER_OFFSET_SIZE: usize = mem::size_of::<HeaderOffset>();

/// End of a free list of slot indices.
pub(crate) const NIL: u32 = u32::MAX;

/// This is the structure of a block. The fields of the block are its metadata,
/// the content is placed after this header.
///
/// ```text
/// +---------------------+ <------+
/// |      used_size      |        |
/// +---------------------+        |
/// |     block_size      |        |
/// +---------------------+        | -> Header (32 bytes)
/// |     pool_block      |        |
/// +---------------------+        |
/// |  slot  | next_free  |        |
/// +---------------------+ <------+
/// |      (padding)      |        |
/// +---------------------+        |
/// |    HeaderOffset     |        |
/// +---------------------+ <------|---- user pointer
/// |       Content       |        | -> Addressable content
/// |         ...         |        |    (HeaderOffset + block_size bytes)
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// While the block is free, `next_free` links it into the free list of its
/// pool block. While it is in use, `used_size` is what the caller asked for.
#[repr(C, align(16))]
pub(crate) struct BlockHeader {
    /// Bytes requested by the caller.
    pub used_size: usize,
    /// Usable bytes, fixed per pool.
    pub block_size: usize,
    /// Pool block which the block belongs to.
    pub pool_block: NonNull<Node<PoolBlock>>,
    /// Index of the block inside of its pool block.
    pub slot: u32,
    pub next_free: u32,
}

/// Back pointer written right before every user pointer, so the header can be
/// found no matter how much alignment padding was inserted.
///
/// Byte layout: the address of the [`BlockHeader`] as a native endian machine
/// word, followed by padding up to 16 bytes.
#[repr(C, align(16))]
pub(crate) struct HeaderOffset {
    pub header: NonNull<BlockHeader>,
}

/// Computes where the user pointer of `header` goes for `alignment`.
///
/// The first address past the header that leaves room for a [`HeaderOffset`]
/// and satisfies `alignment`. For the default alignment that is always
/// `header + BLOCK_HEADER_SIZE + HEADER_OFFSET_SIZE`.
#[inline]
pub(crate) fn user_offset(header: NonNull<BlockHeader>, alignment: usize) -> usize {
    let data = header.as_ptr() as usize + BLOCK_HEADER_SIZE;

    align(data + HEADER_OFFSET_SIZE, alignment) - header.as_ptr() as usize
}

/// Writes the [`HeaderOffset`] of `header` and returns the user pointer.
///
/// **SAFETY**: `header` must be the start of a slot with at least
/// `alignment + block_size` bytes past the header, and `alignment` a power of
/// two of at least 16.
pub(crate) unsafe fn encode(header: NonNull<BlockHeader>, alignment: usize) -> NonNull<u8> {
    unsafe {
        let user = header.cast::<u8>().add(user_offset(header, alignment));
        write_offset(user, header);
        user
    }
}

/// **SAFETY**: `user - HEADER_OFFSET_SIZE` must be writable and 16 aligned.
#[inline]
pub(crate) unsafe fn write_offset(user: NonNull<u8>, header: NonNull<BlockHeader>) {
    unsafe {
        user.sub(HEADER_OFFSET_SIZE).cast::<HeaderOffset>().write(HeaderOffset { header });
    }
}

/// Finds the header of a pointer returned by [`encode`].
///
/// **SAFETY**: `user` must have been returned by [`encode`] and the block must
/// not have been freed.
#[inline]
pub(crate) unsafe fn decode(user: NonNull<u8>) -> NonNull<BlockHeader> {
    unsafe { user.sub(HEADER_OFFSET_SIZE).cast::<HeaderOffset>().read().header }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{self, Layout};

    #[test]
    fn layout_contract() {
        assert_eq!(BLOCK_HEADER_SIZE, 32);
        assert_eq!(HEADER_OFFSET_SIZE, 16);
        assert_eq!(mem::align_of::<BlockHeader>(), 16);
        assert_eq!(mem::align_of::<HeaderOffset>(), 16);
    }

    #[test]
    fn encode_decode_every_alignment() {
        const BLOCK_SIZE: usize = 64;
        let mut alignment = 16;

        while alignment <= 4096 {
            // Slots are only 16 aligned, so place the header at an odd multiple of 16.
            let layout = Layout::from_size_align(2 * alignment + 4096 + BLOCK_SIZE, 4096).unwrap();

            unsafe {
                let buffer = alloc::alloc(layout);
                let header = NonNull::new(buffer.add(48)).unwrap().cast::<BlockHeader>();

                header.write(BlockHeader {
                    used_size: 7,
                    block_size: BLOCK_SIZE,
                    pool_block: NonNull::dangling(),
                    slot: 0,
                    next_free: NIL,
                });

                let user = encode(header, alignment);
                let data = header.as_ptr() as usize + BLOCK_HEADER_SIZE;

                assert_eq!(user.as_ptr() as usize % alignment, 0);
                assert!(user.as_ptr() as usize >= data + HEADER_OFFSET_SIZE);
                // Room for what the caller asked plus the alignment budget.
                assert!(user.as_ptr() as usize - data <= alignment.max(HEADER_OFFSET_SIZE));
                assert_eq!(decode(user), header);
                assert_eq!(decode(user).as_ref().used_size, 7);

                alloc::dealloc(buffer, layout);
            }

            alignment *= 2;
        }
    }

    #[test]
    fn default_alignment_has_no_padding() {
        let layout = Layout::from_size_align(256, 16).unwrap();

        unsafe {
            let buffer = alloc::alloc(layout);
            let header = NonNull::new(buffer).unwrap().cast::<BlockHeader>();

            assert_eq!(user_offset(header, 16), BLOCK_HEADER_SIZE + HEADER_OFFSET_SIZE);

            alloc::dealloc(buffer, layout);
        }
    }
}
