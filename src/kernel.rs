use std::ptr;

/// Contiguous range of virtual memory handed out by a [`PlatformMemory`]
/// implementation or by the [`crate::PageAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    base: *mut u8,
    size: usize,
}

impl MemoryBlock {
    pub const fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn empty() -> Self {
        Self { base: ptr::null_mut(), size: 0 }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.base as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.addr() + self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.base.is_null() || self.size == 0
    }

    /// Whether `addr` falls inside of this block.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.end()
    }
}

impl Default for MemoryBlock {
    fn default() -> Self {
        Self::empty()
    }
}

/// Page protection requested through [`PlatformMemory::protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    NoAccess,
    ReadOnly,
    ReadWrite,
    Execute,
    FullAccess,
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocator, our top level view of this, has nothing
/// to do with the concrete implementations / APIs offered by each kernel.
///
/// Every method reports failure through its return value, none of them panic.
pub trait PlatformMemory {
    /// Reserves `size` bytes of address space. The size is rounded up to the
    /// page size. Reserved memory is not accessible until committed.
    ///
    /// # Safety
    /// The returned block must only be released through this same provider.
    unsafe fn reserve(&self, size: usize) -> Option<MemoryBlock>;

    /// Backs a reserved `block` with read-write memory.
    ///
    /// # Safety
    /// `block` must lie inside of a reservation made by this provider.
    unsafe fn commit(&self, block: MemoryBlock) -> bool;

    /// Returns the physical pages of `block` to the OS, keeping the reservation.
    ///
    /// # Safety
    /// `block` must lie inside of a reservation made by this provider and its
    /// content must not be used afterwards.
    unsafe fn decommit(&self, block: MemoryBlock) -> bool;

    /// Returns the whole reservation starting at `block.base()` to the OS.
    ///
    /// # Safety
    /// `block` must be exactly a block returned by [`PlatformMemory::reserve`].
    unsafe fn release(&self, block: MemoryBlock) -> bool;

    /// Changes the page protection of `block`.
    ///
    /// # Safety
    /// `block` must lie inside of a committed reservation made by this provider.
    unsafe fn protect(&self, block: MemoryBlock, access: Access) -> bool;

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size(&self) -> usize;

    fn is_protection_supported(&self) -> bool {
        true
    }

    /// Reserve and commit in one go, undoing the reservation if the commit fails.
    ///
    /// # Safety
    /// Same contract as [`PlatformMemory::reserve`].
    unsafe fn reserve_committed(&self, size: usize) -> Option<MemoryBlock> {
        unsafe {
            let block = self.reserve(size)?;

            if self.commit(block) {
                Some(block)
            } else {
                self.release(block);
                None
            }
        }
    }
}

impl<T: PlatformMemory + ?Sized> PlatformMemory for &T {
    unsafe fn reserve(&self, size: usize) -> Option<MemoryBlock> {
        unsafe { (**self).reserve(size) }
    }

    unsafe fn commit(&self, block: MemoryBlock) -> bool {
        unsafe { (**self).commit(block) }
    }

    unsafe fn decommit(&self, block: MemoryBlock) -> bool {
        unsafe { (**self).decommit(block) }
    }

    unsafe fn release(&self, block: MemoryBlock) -> bool {
        unsafe { (**self).release(block) }
    }

    unsafe fn protect(&self, block: MemoryBlock, access: Access) -> bool {
        unsafe { (**self).protect(block, access) }
    }

    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn is_protection_supported(&self) -> bool {
        (**self).is_protection_supported()
    }
}

/// Operating system backend of [`PlatformMemory`]. Which implementation is
/// used is decided at compile time by the target.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

#[cfg(unix)]
mod unix {
    use super::{Access, Kernel, MemoryBlock, PlatformMemory};
    use crate::utils::align;

    use libc::{c_int, c_void, off_t, size_t};

    use std::ptr;

    fn translate(access: Access) -> c_int {
        match access {
            Access::NoAccess => libc::PROT_NONE,
            Access::ReadOnly => libc::PROT_READ,
            Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Access::Execute => libc::PROT_EXEC,
            Access::FullAccess => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    impl PlatformMemory for Kernel {
        unsafe fn reserve(&self, size: usize) -> Option<MemoryBlock> {
            if size == 0 {
                return None;
            }

            // mmap parameters. Nothing is accessible until `commit`.
            const ADDR: *mut c_void = ptr::null_mut::<c_void>();
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            let len = align(size, self.page_size());

            unsafe {
                let addr = libc::mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(MemoryBlock::new(addr.cast::<u8>(), len)),
                }
            }
        }

        unsafe fn commit(&self, block: MemoryBlock) -> bool {
            unsafe { self.protect(block, Access::ReadWrite) }
        }

        unsafe fn decommit(&self, block: MemoryBlock) -> bool {
            unsafe {
                let addr = block.base().cast::<c_void>();

                libc::madvise(addr, block.size() as size_t, libc::MADV_DONTNEED) == 0
                    && libc::mprotect(addr, block.size() as size_t, libc::PROT_NONE) == 0
            }
        }

        unsafe fn release(&self, block: MemoryBlock) -> bool {
            if block.base().is_null() {
                return false;
            }

            unsafe { libc::munmap(block.base().cast::<c_void>(), block.size() as size_t) == 0 }
        }

        unsafe fn protect(&self, block: MemoryBlock, access: Access) -> bool {
            if block.base().is_null() {
                return false;
            }

            unsafe {
                libc::mprotect(block.base().cast::<c_void>(), block.size() as size_t, translate(access)) == 0
            }
        }

        fn page_size(&self) -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void};

    use super::{Access, Kernel, MemoryBlock, PlatformMemory};
    use crate::utils::align;

    use windows::Win32::System::{Memory, SystemInformation};

    fn translate(access: Access) -> Memory::PAGE_PROTECTION_FLAGS {
        match access {
            Access::NoAccess => Memory::PAGE_NOACCESS,
            Access::ReadOnly => Memory::PAGE_READONLY,
            Access::ReadWrite => Memory::PAGE_READWRITE,
            Access::Execute => Memory::PAGE_EXECUTE,
            Access::FullAccess => Memory::PAGE_EXECUTE_READWRITE,
        }
    }

    impl PlatformMemory for Kernel {
        unsafe fn reserve(&self, size: usize) -> Option<MemoryBlock> {
            if size == 0 {
                return None;
            }

            let len = align(size, self.page_size());

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                if addr.is_null() {
                    None
                } else {
                    Some(MemoryBlock::new(addr.cast(), len))
                }
            }
        }

        unsafe fn commit(&self, block: MemoryBlock) -> bool {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    Some(block.base() as *const c_void),
                    block.size(),
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !addr.is_null()
            }
        }

        unsafe fn decommit(&self, block: MemoryBlock) -> bool {
            unsafe { Memory::VirtualFree(block.base().cast(), block.size(), Memory::MEM_DECOMMIT).is_ok() }
        }

        unsafe fn release(&self, block: MemoryBlock) -> bool {
            if block.base().is_null() {
                return false;
            }

            unsafe { Memory::VirtualFree(block.base().cast(), 0, Memory::MEM_RELEASE).is_ok() }
        }

        unsafe fn protect(&self, block: MemoryBlock, access: Access) -> bool {
            if block.base().is_null() {
                return false;
            }

            let mut old = Memory::PAGE_PROTECTION_FLAGS(0);

            unsafe {
                Memory::VirtualProtect(block.base() as *const c_void, block.size(), translate(access), &mut old)
                    .is_ok()
            }
        }

        fn page_size(&self) -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

/// [`PlatformMemory`] wrapper used by the tests. It counts reservations and
/// releases and can be told to refuse reservations after a budget is spent.
///
/// A shifted kernel hands out reservations that sit `shift` bytes past a
/// 64 KiB boundary, so arenas never start on the arena page grid:
///
/// ```text
///   64K boundary
///   v
///   +-------+-------------------------------+------+
///   | shift |       handed out block        | tail |
///   +-------+-------------------------------+------+
///   ^ real reservation
/// ```
#[cfg(test)]
pub(crate) mod tracking {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::{Access, Kernel, MemoryBlock, PlatformMemory};
    use crate::utils::align;

    const GRID: usize = 64 * 1024;

    #[derive(Debug)]
    pub(crate) struct TrackingKernel {
        pub reserves: AtomicUsize,
        pub releases: AtomicUsize,
        /// Reservations allowed before refusing. `usize::MAX` means unlimited.
        pub budget: AtomicUsize,
        shift: usize,
        /// `(handed out address, real reservation address, real size)`.
        shifted: Mutex<Vec<(usize, usize, usize)>>,
    }

    impl TrackingKernel {
        pub fn new() -> Self {
            Self {
                reserves: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
                budget: AtomicUsize::new(usize::MAX),
                shift: 0,
                shifted: Mutex::new(Vec::new()),
            }
        }

        pub fn with_budget(budget: usize) -> Self {
            let kernel = Self::new();
            kernel.budget.store(budget, Ordering::Relaxed);
            kernel
        }

        /// Every reservation starts one OS page past a 64 KiB boundary.
        pub fn shifted() -> Self {
            Self {
                shift: Kernel.page_size(),
                ..Self::new()
            }
        }

        pub fn live(&self) -> usize {
            self.reserves.load(Ordering::Relaxed) - self.releases.load(Ordering::Relaxed)
        }
    }

    impl PlatformMemory for TrackingKernel {
        unsafe fn reserve(&self, size: usize) -> Option<MemoryBlock> {
            let spent = self.reserves.load(Ordering::Relaxed);

            if spent >= self.budget.load(Ordering::Relaxed) {
                return None;
            }

            let block = if self.shift == 0 {
                unsafe { Kernel.reserve(size)? }
            } else {
                let real = unsafe { Kernel.reserve(size.checked_add(GRID + self.shift)?)? };
                let addr = align(real.addr(), GRID) + self.shift;

                self.shifted.lock().push((addr, real.addr(), real.size()));
                MemoryBlock::new(addr as *mut u8, align(size, self.page_size()))
            };

            self.reserves.fetch_add(1, Ordering::Relaxed);
            Some(block)
        }

        unsafe fn commit(&self, block: MemoryBlock) -> bool {
            unsafe { Kernel.commit(block) }
        }

        unsafe fn decommit(&self, block: MemoryBlock) -> bool {
            unsafe { Kernel.decommit(block) }
        }

        unsafe fn release(&self, block: MemoryBlock) -> bool {
            let real = {
                let mut shifted = self.shifted.lock();

                match shifted.iter().position(|(addr, ..)| *addr == block.addr()) {
                    Some(position) => {
                        let (_, addr, size) = shifted.swap_remove(position);
                        MemoryBlock::new(addr as *mut u8, size)
                    }
                    None => block,
                }
            };

            let released = unsafe { Kernel.release(real) };

            if released {
                self.releases.fetch_add(1, Ordering::Relaxed);
            }

            released
        }

        unsafe fn protect(&self, block: MemoryBlock, access: Access) -> bool {
            unsafe { Kernel.protect(block, access) }
        }

        fn page_size(&self) -> usize {
            Kernel.page_size()
        }
    }
}
