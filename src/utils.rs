//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

/// It aligns `to_be_aligned` up to the next multiple of `aligment`.
///
/// This method is used to align arena runs to the arena page size, pool block
/// reservations to the OS page size and user pointers to the requested
/// alignment. `aligment` must be a power of two.
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around.
#[inline]
pub const fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(aligment - 1) {
        Some(value) => Some(value & !(aligment - 1)),
        None => None,
    }
}

/// It aligns `to_be_aligned` down to the previous multiple of `aligment`.
#[inline]
pub const fn align_down(to_be_aligned: usize, aligment: usize) -> usize {
    to_be_aligned & !(aligment - 1)
}

#[inline]
pub const fn is_aligned(value: usize, aligment: usize) -> bool {
    value & (aligment - 1) == 0
}

#[inline]
pub const fn is_pow2(value: usize) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Smallest `k` such that `2^k >= value`. `ceil_log2(0)` and `ceil_log2(1)` are 0.
#[inline]
pub const fn ceil_log2(value: usize) -> usize {
    if value <= 1 {
        0
    } else {
        (usize::BITS - (value - 1).leading_zeros()) as usize
    }
}

/// Largest `k` such that `2^k <= value`. `value` must not be 0.
#[inline]
pub const fn floor_log2(value: usize) -> usize {
    (usize::BITS - 1 - value.leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn align_pointer_size() {
        let aligments = vec![(1..8, 8), (9..16, 16), (17..24, 24), (25..32, 32)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, mem::size_of::<usize>()));
            }
        }
    }

    #[test]
    fn align_arena_page_size() {
        let aligments = vec![(1..65536, 65536), (65537..131072, 131072)];

        for (sizes, expected) in aligments {
            for size in sizes.step_by(97) {
                assert_eq!(expected, align(size, 65536))
            }
        }
    }

    #[test]
    fn align_down_and_check() {
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4095, 4096), 0);
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(8200, 4096));
        assert_eq!(checked_align(usize::MAX - 3, 16), None);
        assert_eq!(checked_align(17, 16), Some(32));
    }

    #[test]
    fn logarithms() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(256), 8);
        assert_eq!(ceil_log2(257), 9);
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(257), 8);
        assert_eq!(floor_log2(512), 9);
        assert!(is_pow2(1 << 35));
        assert!(!is_pow2(0));
        assert!(!is_pow2(24));
    }
}
