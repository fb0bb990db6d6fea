use std::ptr::NonNull;

/// Round `value` up to a multiple of `align`.
/// Works for any non-zero `align`, not only powers of two.
pub(crate) fn aligned(value: u64, align: u64) -> u64 {
    debug_assert_ne!(align, 0);
    if value == 0 {
        0
    } else if align.is_power_of_two() {
        1u64 + ((value - 1u64) | (align - 1u64))
    } else {
        ((value + align - 1) / align) * align
    }
}

/// Number of `unit`s required to hold `size` bytes.
pub(crate) fn units(size: u64, unit: u64) -> u64 {
    (size + unit - 1) / unit
}

/// `ceil(log2(value))`, with `0` for `value <= 1`.
pub(crate) fn ceil_log2(value: u64) -> u32 {
    if value <= 1 {
        0
    } else {
        64 - (value - 1).leading_zeros()
    }
}

/// Offset mapped pointer by `offset` bytes.
pub(crate) fn offset_ptr(ptr: NonNull<u8>, offset: u64) -> NonNull<u8> {
    debug_assert!(fits_usize(offset));
    unsafe {
        // Pointers handed out by the device are never null and offsets stay within the mapping.
        NonNull::new_unchecked((ptr.as_ptr() as usize + offset as usize) as *mut u8)
    }
}

pub(crate) fn fits_usize(value: u64) -> bool {
    value <= usize::max_value() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_values() {
        assert_eq!(aligned(0, 256), 0);
        assert_eq!(aligned(1, 256), 256);
        assert_eq!(aligned(256, 256), 256);
        assert_eq!(aligned(257, 256), 512);
        assert_eq!(aligned(13, 12), 24);
        assert_eq!(aligned(24, 12), 24);
    }

    #[test]
    fn ceil_log2_values() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(10), 4);
        assert_eq!(ceil_log2(5000), 13);
        assert_eq!(ceil_log2(8192), 13);
    }
}
