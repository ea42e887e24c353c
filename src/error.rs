use thiserror::Error;

/// Every way an allocator operation can fail.
///
/// The public entry points of [`crate::MallocScaled`] never surface these
/// directly, they collapse them into a null pointer, a zero size or `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No arena slot, no arena run or the platform refused a reservation.
    #[error("out of memory")]
    OutOfMemory,
    /// The adjusted request size falls outside of the configured size classes.
    #[error("size {0} is outside of the configured size classes")]
    SizeOutOfRange(usize),
    /// Alignment is not a power of two or is bigger than the page size.
    #[error("alignment {0} is not a power of two or exceeds the page size")]
    InvalidAlignment(usize),
    /// A pool block claims to be fully carved but its free list is empty.
    #[error("pool block at {0:#x} is corrupted")]
    CorruptedPool(usize),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("allocator is already initialized")]
    AlreadyInitialized,
    #[error("allocator is not initialized")]
    NotInitialized,
}
