//! Size-class schedule.
//!
//! Small classes use a static table spaced exponentially in ~16.7%
//! increments, bounding per-object overhead well under 20% for any
//! request. Large classes are computed analytically from a geometric
//! schedule rather than tabulated, since their domain is unbounded.

use crate::limits::{align_up, LARGEST_SMALL, LARGE_CLASS_GROWTH_DEN, LARGE_CLASS_GROWTH_NUM, MAX_ALIGN_SIZE, MIN_ALIGN};

const fn count_small_classes() -> usize {
    let mut size = MIN_ALIGN;
    let mut count = 1;
    while size < LARGEST_SMALL {
        let grown = (size * 7 + 5) / 6; // ~16.7% growth, rounded up
        size = align_up(if grown > size { grown } else { size + MIN_ALIGN }, MAX_ALIGN_SIZE);
        count += 1;
    }
    count
}

pub const NUM_SMALL_CLASSES: usize = count_small_classes();

const fn build_small_classes() -> [usize; NUM_SMALL_CLASSES] {
    let mut table = [0usize; NUM_SMALL_CLASSES];
    let mut size = MIN_ALIGN;
    let mut i = 0;
    while i < NUM_SMALL_CLASSES {
        table[i] = size;
        if size < LARGEST_SMALL {
            let grown = (size * 7 + 5) / 6;
            size = align_up(if grown > size { grown } else { size + MIN_ALIGN }, MAX_ALIGN_SIZE);
        }
        i += 1;
    }
    table
}

/// Slot size for each small class.
static SMALL_CLASS_SIZES: [usize; NUM_SMALL_CLASSES] = build_small_classes();

/// Slot size for small class `c`. O(1) table lookup.
#[inline]
pub fn class_to_size(c: usize) -> usize {
    SMALL_CLASS_SIZES[c]
}

/// Smallest small class whose slot size is `>= size`, or `None` if `size`
/// exceeds `LARGEST_SMALL` and must go through the large-object path.
///
/// A direct table scan over ~30 entries is already branch-predictable
/// and faster in practice than a binary search at this size, but we
/// first narrow with a leading-zero count to the handful of classes that
/// could possibly match, keeping the lookup close to O(1) even as the
/// table grows.
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
    if size > LARGEST_SMALL {
        return None;
    }
    if size <= MIN_ALIGN {
        return Some(0);
    }
    // Every size below `2^k` lives at or before the class whose size first
    // exceeds `2^(k-1)`; this bounds the linear scan to a small window
    // instead of the whole table.
    let hint = (usize::BITS - size.leading_zeros()) as usize;
    let start = hint.saturating_sub(5).min(NUM_SMALL_CLASSES - 1);
    for c in start..NUM_SMALL_CLASSES {
        if SMALL_CLASS_SIZES[c] >= size {
            return Some(c);
        }
    }
    Some(NUM_SMALL_CLASSES - 1)
}

/// Exact large-class size for index `i`: `c_i = ceil((1+eps)^i * A)`,
/// `A` the minimum alignment.
pub fn large_class_size(i: u32) -> usize {
    let a = MAX_ALIGN_SIZE as u128;
    let num = LARGE_CLASS_GROWTH_NUM as u128;
    let den = LARGE_CLASS_GROWTH_DEN as u128;
    let mut value = a;
    let mut num_pow = 1u128;
    let mut den_pow = 1u128;
    for _ in 0..i {
        num_pow *= num;
        den_pow *= den;
    }
    value = value * num_pow;
    // ceil division
    let size = (value + den_pow - 1) / den_pow;
    size as usize
}

/// Smallest large-class index whose size is `>= size`. Large sizes are
/// unbounded so, unlike small classes, this walks the geometric schedule
/// rather than a table; the index space only grows logarithmically with
/// `size` (each step is ~16.7% bigger) so this terminates in well under a
/// hundred iterations even for multi-gigabyte requests.
pub fn large_class_for(size: usize) -> u32 {
    let mut i = 0u32;
    while large_class_size(i) < size {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_classes_cover_without_excess_overhead() {
        for size in 1..=LARGEST_SMALL {
            if let Some(c) = size_to_class(size) {
                let slot = class_to_size(c);
                assert!(slot >= size, "class {} too small for {}", c, size);
                // Bound fragmentation: no class should overshoot by more
                // than ~20% of the requested size, plus one alignment
                // step of slack for small sizes.
                if size > MAX_ALIGN_SIZE {
                    assert!(
                        slot <= size + size / 5 + MAX_ALIGN_SIZE,
                        "class {} ({} bytes) overshoots {} by more than budget",
                        c,
                        slot,
                        size
                    );
                }
            } else {
                panic!("size {} should have fit a small class", size);
            }
        }
    }

    #[test]
    fn classes_are_monotonically_increasing() {
        for c in 1..NUM_SMALL_CLASSES {
            assert!(class_to_size(c) > class_to_size(c - 1));
        }
    }

    #[test]
    fn oversize_request_has_no_small_class() {
        assert!(size_to_class(LARGEST_SMALL + 1).is_none());
    }

    #[test]
    fn small_class_count_is_near_thirty() {
        assert!(NUM_SMALL_CLASSES <= 40, "grew too far: {}", NUM_SMALL_CLASSES);
    }

    #[test]
    fn large_classes_cover_and_grow() {
        let mut prev = 0;
        for i in 0..20 {
            let s = large_class_size(i);
            assert!(s > prev);
            prev = s;
        }
        let idx = large_class_for(1_000_000);
        assert!(large_class_size(idx) >= 1_000_000);
        assert!(idx == 0 || large_class_size(idx - 1) < 1_000_000);
    }
}
