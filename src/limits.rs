//! Fundamental tunables shared by every layer of the allocator.

/// Superblock size `S`: a power of two, 64 KiB by default. All
/// superblocks are mapped aligned to this boundary so that `containing(p)`
/// can recover a superblock from any interior pointer with a single mask.
pub const SUPERBLOCK_SHIFT: usize = 16;
pub const SUPERBLOCK_SIZE: usize = 1 << SUPERBLOCK_SHIFT;
pub const SUPERBLOCK_MASK: usize = SUPERBLOCK_SIZE - 1;

/// `K` in the reclamation predicate: number of emptiness rings a
/// per-size-class bin is partitioned into.
pub const EMPTINESS_CLASSES: usize = 8;

/// Minimal alignment guaranteed to every allocation regardless of
/// requested size, matching platforms that need 16-byte alignment for
/// SSE-class registers.
pub const MAX_ALIGN_SIZE: usize = 16;

/// Minimum slot size: every size class must be at least pointer-sized
/// because the free list stores its next-pointer inside the free slot
/// itself. Folded in with `MAX_ALIGN_SIZE` so every class is also
/// SSE-aligned — pointer-sized alone (8 bytes on 64-bit) would satisfy
/// the free-list trick but not the platform's stricter alignment
/// guarantee.
pub const MIN_ALIGN: usize = MAX_ALIGN_SIZE;

const _: () = assert!(MIN_ALIGN >= core::mem::size_of::<usize>());

/// Reserved header budget per superblock. The real header
/// (`superblock::Header`) is checked against this bound with a `const`
/// assertion in `superblock.rs` so the two never drift silently.
pub const SUPERBLOCK_HEADER_RESERVE: usize = 256;

/// Small-object maximum: requests above this go to the large-object
/// engine instead of a superblock.
pub const LARGEST_SMALL: usize = SUPERBLOCK_SIZE - SUPERBLOCK_HEADER_RESERVE;

/// Growth factor for the large-object geometric schedule (~20% per
/// step), expressed as a fixed-point fraction to keep the schedule
/// deterministic across platforms.
pub const LARGE_CLASS_GROWTH_NUM: u64 = 6;
pub const LARGE_CLASS_GROWTH_DEN: u64 = 5;

/// Slop bound numerator/denominator for the large-object cache: once
/// cached bytes exceed this fraction over live bytes, every cached large
/// object is released back to the page source.
pub const LARGE_SLOP_NUM: u64 = 6;
pub const LARGE_SLOP_DEN: u64 = 5;

#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down(size: usize, align: usize) -> usize {
    size & !(align - 1)
}
