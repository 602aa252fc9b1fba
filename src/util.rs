#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}
#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !align.wrapping_sub(1)
}
#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Number of bytes between `start` and `end`. `end` must not be below `start`.
#[inline(always)]
pub fn distance(start: *const u8, end: *const u8) -> usize {
    debug_assert!(end >= start);
    end as usize - start as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(13, 8), 16);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_down(13, 8), 8);
        assert!(is_aligned(4096, 4096));
        assert!(!is_aligned(4097, 8));
    }
}
