//! Pure guest-physical range arithmetic for the mapping table.
//!
//! Ranges are half-open `[start, start + len)`.  Every function rejects
//! ranges whose end would overflow `u64`, so callers never see wrapped
//! intervals.

/// Guest page size.
pub const PAGE_SIZE: u64 = 4096;

#[inline]
pub(crate) const fn is_page_aligned(v: u64) -> bool {
    v % PAGE_SIZE == 0
}

/// Exclusive end of `[start, start + len)`, or `None` on overflow.
#[inline]
pub(crate) fn range_end(start: u64, len: u64) -> Option<u64> {
    start.checked_add(len)
}

/// Whether two non-empty ranges intersect.
pub(crate) fn ranges_overlap(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> bool {
    debug_assert!(a_len > 0 && b_len > 0, "empty ranges never reach the table");
    let (Some(a_end), Some(b_end)) = (range_end(a_start, a_len), range_end(b_start, b_len)) else {
        return true;
    };
    let overlap = a_start < b_end && b_start < a_end;

    // Postcondition: symmetric.
    debug_assert_eq!(overlap, b_start < a_end && a_start < b_end);
    overlap
}

/// Whether `[offset, offset + len)` lies inside an object of `obj_len` bytes.
pub(crate) fn range_within(offset: u64, len: u64, obj_len: u64) -> bool {
    match range_end(offset, len) {
        Some(end) => end <= obj_len,
        None => false,
    }
}

/// Whether `addr` falls inside `[start, start + len)`.
pub(crate) fn contains(start: u64, len: u64, addr: u64) -> bool {
    addr >= start && addr - start < len
}
