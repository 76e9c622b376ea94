//! Power-of-two alignment helpers on raw `u64` values.

/// Rounds `value` down to a multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align`.
///
/// `align` must be a power of two. Overflows past `u64::MAX` wrap in release
/// builds; callers stay well below the canonical address limit.
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[inline]
#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    debug_assert!(align.is_power_of_two());
    value & (align - 1) == 0
}

/// Smallest `n` such that `1 << n >= value`.
///
/// ```rust
/// # use kernel_memory_addresses::log2_up;
/// assert_eq!(log2_up(1), 0);
/// assert_eq!(log2_up(4096), 12);
/// assert_eq!(log2_up(4097), 13);
/// ```
#[inline]
#[must_use]
pub const fn log2_up(value: u64) -> u32 {
    if value <= 1 {
        0
    } else {
        u64::BITS - (value - 1).leading_zeros()
    }
}
