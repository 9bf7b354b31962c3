//! # Alignment Utilities
//!
//! Power-of-two checks and offset rounding shared by every allocator.
//! All `align` arguments must be non-zero powers of two.

/// Size of one intrusive link word in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Alignment used when a caller does not ask for one.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Returns true if `value` is a non-zero power of two.
#[inline]
#[must_use]
pub const fn is_power_of_two(value: usize) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Rounds `value` up to the next multiple of `align`.
///
/// Overflows (and panics in debug builds) if the result does not fit in a
/// `usize`; use [`checked_align_up`] on untrusted input.
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(is_power_of_two(align), "alignment must be a power of two");
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` up to the next multiple of `align`, or `None` on overflow.
#[inline]
#[must_use]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(is_power_of_two(align), "alignment must be a power of two");
    match value.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

/// Rounds `value` down to the previous multiple of `align`.
#[inline]
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(is_power_of_two(align), "alignment must be a power of two");
    value & !(align - 1)
}

/// Returns true if `value` is a multiple of `align`.
#[inline]
#[must_use]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Bytes that must be skipped from `addr` to reach an `align` boundary.
#[inline]
#[must_use]
pub const fn padding_for(addr: usize, align: usize) -> usize {
    debug_assert!(is_power_of_two(align), "alignment must be a power of two");
    addr.wrapping_neg() & (align - 1)
}

/// Smallest `k` with `2^k >= value`. `ceil_log2(0) == ceil_log2(1) == 0`.
#[inline]
#[must_use]
pub const fn ceil_log2(value: usize) -> u32 {
    if value <= 1 {
        0
    } else {
        usize::BITS - (value - 1).leading_zeros()
    }
}

/// Largest `k` with `2^k <= value`.
///
/// # Panics
///
/// Panics if `value` is zero.
#[inline]
#[must_use]
pub const fn floor_log2(value: usize) -> u32 {
    assert!(value != 0, "floor_log2 of zero");
    usize::BITS - 1 - value.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two() {
        assert!(!is_power_of_two(0));
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(64));
        assert!(!is_power_of_two(96));
        assert!(is_power_of_two(1 << (usize::BITS - 1)));
    }

    #[test]
    fn test_align_up_and_down() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 8), 24);
        assert_eq!(align_down(17, 8), 16);
        assert_eq!(align_down(15, 16), 0);
    }

    #[test]
    fn test_checked_align_up_overflow() {
        assert_eq!(checked_align_up(usize::MAX, 2), None);
        assert_eq!(checked_align_up(usize::MAX - 15, 16), Some(usize::MAX - 15));
        assert_eq!(checked_align_up(5, 4), Some(8));
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding_for(0x1000, 64), 0);
        assert_eq!(padding_for(0x1001, 64), 63);
        assert_eq!(padding_for(0x1038, 16), 8);
        for addr in 0..256 {
            assert!(is_aligned(addr + padding_for(addr, 32), 32));
        }
    }

    #[test]
    fn test_logs() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(1024), 10);
        assert_eq!(ceil_log2(1025), 11);
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(1023), 9);
        assert_eq!(floor_log2(1024), 10);
    }
}
