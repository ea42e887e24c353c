use std::{
    mem,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice,
};

use crate::{kernel::MemoryBlock, utils::is_aligned};

/// Fixed capacity table of `T` records carved out of a committed
/// [`MemoryBlock`].
///
/// We can't use a `Vec` for our own bookkeeping since we are the allocator,
/// so every metadata table (arena slots, arena page runs, pool table entries)
/// lives inside of memory we got from the platform. The table does not own
/// that memory: whoever carved it keeps the [`MemoryBlock`] and releases it.
pub(crate) struct Slots<T> {
    ptr: NonNull<T>,
    len: usize,
}

impl<T: Default> Slots<T> {
    /// Bytes needed to hold `len` records.
    pub const fn bytes_for(len: usize) -> usize {
        len * mem::size_of::<T>()
    }

    /// Writes `len` default records at the beginning of `block`.
    ///
    /// Returns `None` if `block` is too small for `len` records or if its base
    /// is not aligned for `T`.
    ///
    /// **SAFETY**: `block` must be committed, writable and not used by anything
    /// else for as long as the table is alive.
    pub unsafe fn carve(block: MemoryBlock, len: usize) -> Option<Self> {
        if len == 0 || block.base().is_null() {
            return None;
        }

        if Self::bytes_for(len) > block.size() || !is_aligned(block.addr(), mem::align_of::<T>()) {
            return None;
        }

        let ptr = NonNull::new(block.base().cast::<T>())?;

        unsafe {
            for i in 0..len {
                ptr.as_ptr().add(i).write(T::default());
            }
        }

        Some(Self { ptr, len })
    }
}

impl<T> Deref for Slots<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for Slots<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}
