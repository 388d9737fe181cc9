//! The superblock: a fixed-size, `S`-aligned region divided into
//! equal-sized slots of one size class, plus the identical-layout header
//! used by large objects so `containing()` and owner dispatch work the
//! same way on both.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Once;

use crate::limits::{SUPERBLOCK_HEADER_RESERVE, SUPERBLOCK_MASK, SUPERBLOCK_SIZE};
use crate::size_class;
use crate::sync::SpinMutex;

/// Which kind of heap currently owns a superblock. Stored as a plain
/// byte so it can be read with a single atomic load without taking the
/// header's lock, and written only while that lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OwnerKind {
    Pph = 0,
    Global = 1,
    Large = 2,
}

impl OwnerKind {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OwnerKind::Pph,
            1 => OwnerKind::Global,
            _ => OwnerKind::Large,
        }
    }
}

/// Intrusive membership in exactly one free list or emptiness ring:
/// either a PPH size-class bin's emptiness ring, or the global heap's
/// pool.
#[derive(Clone, Copy)]
pub struct ListLinks {
    pub prev: *mut Header,
    pub next: *mut Header,
}

impl Default for ListLinks {
    fn default() -> Self {
        ListLinks {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

/// A free slot's sole content: the next-pointer of the intrusive free
/// list, stored inside the slot itself.
struct FreeSlot {
    next: *mut FreeSlot,
}

/// Mutable state protected by the header's own lock. Every field here is
/// mutated only while that lock is held.
pub struct Inner {
    pub size_class: usize,
    /// Exact payload size: `class_to_size(size_class)` for small
    /// superblocks, the requested size (rounded to a large class) for a
    /// large object.
    pub object_size: usize,
    free_list: *mut FreeSlot,
    pub used_count: u32,
    pub total_count: u32,
    pub emptiness_class: u8,
    pub payload_start: *mut u8,
    /// The exact `(base, len)` this region was mapped with, so
    /// `release`/`release_aligned` can be handed back the precise region
    /// even when `payload_start` sits well past `header` due to
    /// over-alignment padding.
    pub map_base: *mut u8,
    pub map_len: usize,
}

/// The superblock/large-object header. Lives at the very start of the
/// mapped region it describes; `payload_start` in [`Inner`] points just
/// past it (plus alignment padding).
#[repr(C)]
pub struct Header {
    magic: usize,
    object_kind: AtomicU8,
    owner_kind: AtomicU8,
    owner_ptr: AtomicPtr<()>,
    /// Ring/pool linkage: synchronized externally by whichever structure
    /// currently owns this superblock (the owning PPH bin's lock, the
    /// global heap pool's lock, or the large heap's class-list lock) —
    /// never by this header's own lock below. Splicing a ring or free
    /// list therefore never requires locking a second superblock.
    list_links: UnsafeCell<ListLinks>,
    inner: SpinMutex<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ObjectKind {
    Small = 0,
    Large = 1,
}

const HEADER_SIZE: usize = core::mem::size_of::<Header>();
const _: () = assert!(
    HEADER_SIZE <= SUPERBLOCK_HEADER_RESERVE,
    "superblock::Header grew past the reserved small-object budget"
);

static MAGIC_SEED_ONCE: Once = Once::new();
static MAGIC_SEED: AtomicUsize = AtomicUsize::new(0);

/// A process-wide cookie mixed into every header's `magic` field. Not a
/// security mechanism — just enough entropy that an arbitrary foreign
/// pointer practically never happens to satisfy the address-dependent
/// check in [`validate`].
fn magic_seed() -> usize {
    MAGIC_SEED_ONCE.call_once(|| {
        let marker = 0u8;
        let addr = &marker as *const u8 as usize;
        MAGIC_SEED.store(addr.wrapping_mul(0x9E3779B97F4A7C15), Ordering::Relaxed);
    });
    MAGIC_SEED.load(Ordering::Relaxed)
}

fn magic_for(header_addr: usize) -> usize {
    header_addr ^ magic_seed()
}

/// Format a freshly-mapped, `SUPERBLOCK_SIZE`-aligned region as a small-
/// object superblock for `size_class`.
///
/// # Safety
/// `raw` must point to at least `SUPERBLOCK_SIZE` bytes of writable,
/// exclusively-owned memory, aligned to `SUPERBLOCK_SIZE`.
pub unsafe fn format_small(raw: *mut u8, size_class: usize) -> *mut Header {
    let header = raw as *mut Header;
    let object_size = size_class::class_to_size(size_class);
    let payload_start = align_payload_start(raw, object_size);
    let payload_len = (raw as usize + SUPERBLOCK_SIZE) - payload_start as usize;
    let total_count = (payload_len / object_size) as u32;

    let free_list = build_free_list(payload_start, object_size, total_count);

    ptr::write(
        header,
        Header {
            magic: magic_for(raw as usize),
            object_kind: AtomicU8::new(ObjectKind::Small as u8),
            owner_kind: AtomicU8::new(OwnerKind::Global as u8),
            owner_ptr: AtomicPtr::new(ptr::null_mut()),
            list_links: UnsafeCell::new(ListLinks::default()),
            inner: SpinMutex::new(Inner {
                size_class,
                object_size,
                free_list,
                used_count: 0,
                total_count,
                emptiness_class: 0,
                payload_start,
                map_base: raw,
                map_len: SUPERBLOCK_SIZE,
            }),
        },
    );
    header
}

/// Reformat an already-mapped superblock for a different size class.
/// Only valid while the caller has exclusive access (the superblock
/// sits in the global heap's empty pool, not yet published to any PPH).
///
/// # Safety
/// Caller must hold exclusive access to `header` (e.g. the global heap's
/// own lock while the superblock is in its pool).
pub unsafe fn reformat_small(header: *mut Header, size_class: usize) {
    let raw = header as *mut u8;
    let object_size = size_class::class_to_size(size_class);
    let payload_start = align_payload_start(raw, object_size);
    let payload_len = (raw as usize + SUPERBLOCK_SIZE) - payload_start as usize;
    let total_count = (payload_len / object_size) as u32;
    let free_list = build_free_list(payload_start, object_size, total_count);

    (*header).object_kind.store(ObjectKind::Small as u8, Ordering::Relaxed);
    let mut inner = (*header).inner.lock();
    inner.size_class = size_class;
    inner.object_size = object_size;
    inner.free_list = free_list;
    inner.used_count = 0;
    inner.total_count = total_count;
    inner.emptiness_class = 0;
    inner.payload_start = payload_start;
}

/// Format a freshly-mapped region as a single large object, with the
/// header placed immediately adjacent to a `MAX_ALIGN_SIZE`-
/// aligned payload. Unlike a small superblock the region need not be
/// `SUPERBLOCK_SIZE`-aligned or sized; `containing` falls back to an
/// adjacent-header probe for pointers that don't resolve via the
/// small-superblock mask.
///
/// # Safety
/// `raw` must point to at least `HEADER_SIZE + object_size` writable,
/// exclusively-owned bytes, and must be the exact `(raw, map_len)` pair
/// this region was obtained from the page source with.
pub unsafe fn format_large(raw: *mut u8, object_size: usize, map_len: usize) -> *mut Header {
    format_large_aligned(raw, object_size, crate::limits::MAX_ALIGN_SIZE, raw, map_len)
}

/// Format a freshly-mapped region as a single large object whose payload
/// is aligned to `align` (used for alignment requests stricter than
/// `MAX_ALIGN_SIZE`). The header is placed at `payload - HEADER_SIZE`,
/// wherever that lands inside `raw` — `containing`'s adjacent-header
/// probe only ever looks at
/// `p - HEADER_SIZE`, so this keeps it correct regardless of how much
/// alignment padding precedes the header. `map_base`/`map_len` record the
/// *original* page-source allocation so `release_aligned` gets back the
/// exact region even though the header itself is not at `map_base`.
///
/// # Safety
/// `raw` must point to at least `align + HEADER_SIZE + object_size`
/// writable, exclusively-owned bytes; `(map_base, map_len)` must be
/// the exact region this memory was obtained from the page source with.
pub unsafe fn format_large_aligned(
    raw: *mut u8,
    object_size: usize,
    align: usize,
    map_base: *mut u8,
    map_len: usize,
) -> *mut Header {
    let payload_start = crate::limits::align_up(raw as usize + HEADER_SIZE, align) as *mut u8;
    let header_addr = (payload_start as usize - HEADER_SIZE) as *mut u8;
    let header = header_addr as *mut Header;
    ptr::write(
        header,
        Header {
            magic: magic_for(header_addr as usize),
            object_kind: AtomicU8::new(ObjectKind::Large as u8),
            owner_kind: AtomicU8::new(OwnerKind::Large as u8),
            owner_ptr: AtomicPtr::new(ptr::null_mut()),
            list_links: UnsafeCell::new(ListLinks::default()),
            inner: SpinMutex::new(Inner {
                size_class: 0,
                object_size,
                free_list: ptr::null_mut(),
                used_count: 1,
                total_count: 1,
                emptiness_class: 0,
                payload_start,
                map_base,
                map_len,
            }),
        },
    );
    header
}

fn align_payload_start(raw: *mut u8, _object_size: usize) -> *mut u8 {
    let after_header = raw as usize + HEADER_SIZE;
    crate::limits::align_up(after_header, crate::limits::MAX_ALIGN_SIZE) as *mut u8
}

unsafe fn build_free_list(start: *mut u8, object_size: usize, count: u32) -> *mut FreeSlot {
    if count == 0 {
        return ptr::null_mut();
    }
    let mut head: *mut FreeSlot = ptr::null_mut();
    // Build tail-to-head so the free list is returned in ascending
    // address order, which keeps early allocations from a fresh
    // superblock sequential (good cache behavior).
    for i in (0..count).rev() {
        let slot = start.add(i as usize * object_size) as *mut FreeSlot;
        (*slot).next = head;
        head = slot;
    }
    head
}

/// Given any pointer returned by this allocator, recover its header.
///
/// Small allocations are found by masking to the superblock alignment
/// boundary. Large allocations are not necessarily superblock-aligned
/// or -sized, so they're found by a fixed offset immediately preceding
/// the payload instead — the header still validates with the same
/// magic check either way, so every caller downstream of `containing`
/// treats both uniformly.
pub unsafe fn containing(p: *const u8) -> Option<*mut Header> {
    let masked = (p as usize & !SUPERBLOCK_MASK) as *mut Header;
    if validate(masked) {
        return Some(masked);
    }
    if (p as usize) >= HEADER_SIZE {
        let adjacent = (p as usize - HEADER_SIZE) as *mut Header;
        if validate(adjacent) {
            return Some(adjacent);
        }
    }
    None
}

unsafe fn validate(header: *mut Header) -> bool {
    // The header's own memory might not even be mapped/readable for an
    // arbitrary foreign pointer; this is a best-effort check that only
    // catches the common case (a pointer into memory this allocator
    // actually owns but didn't hand out, e.g. a double-free of something
    // already returned to the page source). We can't safely probe
    // unmapped memory in general.
    if header.is_null() {
        return false;
    }
    (*header).magic == magic_for(header as usize)
}

pub unsafe fn is_large(header: *mut Header) -> bool {
    (*header).object_kind.load(Ordering::Relaxed) == ObjectKind::Large as u8
}

pub unsafe fn owner_kind(header: *mut Header) -> OwnerKind {
    OwnerKind::from_u8((*header).owner_kind.load(Ordering::Acquire))
}

pub unsafe fn owner_ptr(header: *mut Header) -> *mut () {
    (*header).owner_ptr.load(Ordering::Acquire)
}

/// Set the owner. Caller must hold `header`'s lock (the guard is taken as
/// a proof token) — writes go through the atomic fields with `Release`
/// ordering so other threads can observe them via [`owner_kind`]/
/// [`owner_ptr`] without taking the lock.
pub unsafe fn set_owner(header: *mut Header, _guard: &mut Inner, kind: OwnerKind, ptr: *mut ()) {
    (*header).owner_ptr.store(ptr, Ordering::Release);
    (*header).owner_kind.store(kind as u8, Ordering::Release);
}

/// Raw access to `header`'s ring/pool linkage. Callers must already hold
/// whichever lock currently governs `header` (the owning PPH bin's lock,
/// the global heap pool's lock, or the large heap's class-list lock) —
/// this never takes `header`'s own lock.
pub unsafe fn list_links(header: *mut Header) -> *mut ListLinks {
    (*header).list_links.get()
}

pub unsafe fn lock(header: *mut Header) -> crate::sync::SpinMutexGuard<'static, Inner> {
    // SAFETY: callers guarantee `header` stays mapped for as long as any
    // guard derived from it is held; raw-pointer deref has no lifetime of
    // its own, so we're free to name it `'static` here the same way the
    // rest of this module treats every superblock/large-object header.
    let inner: &'static SpinMutex<Inner> = &(*header).inner;
    inner.lock()
}

/// Pop a free slot. `None` if the superblock is full.
pub unsafe fn alloc_slot(header: *mut Header) -> Option<*mut u8> {
    let mut inner = lock(header);
    let slot = inner.free_list;
    if slot.is_null() {
        return None;
    }
    inner.free_list = (*slot).next;
    inner.used_count += 1;
    recompute_emptiness(&mut inner);
    Some(slot as *mut u8)
}

/// Whether this superblock currently has at least one free slot. Used by
/// the PPH's replacement scan to skip exhausted superblocks sitting in
/// the full ring rather than re-selecting one with nothing to give out.
pub unsafe fn has_free_slot(header: *mut Header) -> bool {
    let inner = lock(header);
    inner.used_count < inner.total_count
}

/// Push a slot back onto the free list.
pub unsafe fn free_slot(header: *mut Header, p: *mut u8) {
    let mut inner = lock(header);
    free_slot_locked(&mut inner, p);
}

/// Same as [`free_slot`], but for callers that already hold `header`'s
/// lock — the owner-dispatch free path locks the superblock first, then
/// its owner, and needs to mutate both under the single superblock
/// guard it already took.
pub unsafe fn free_slot_locked(inner: &mut Inner, p: *mut u8) {
    let slot = p as *mut FreeSlot;
    (*slot).next = inner.free_list;
    inner.free_list = slot;
    inner.used_count -= 1;
    recompute_emptiness(inner);
}

fn recompute_emptiness(inner: &mut Inner) {
    inner.emptiness_class = emptiness_class_for(inner.used_count, inner.total_count);
}

/// Map `used/total` to one of `EMPTINESS_CLASSES` rings, "almost empty"
/// (0) to "full" (`K-1`).
pub fn emptiness_class_for(used: u32, total: u32) -> u8 {
    use crate::limits::EMPTINESS_CLASSES;
    if total == 0 {
        return 0;
    }
    let k = EMPTINESS_CLASSES as u64;
    let frac = (used as u64 * k) / (total as u64).max(1);
    frac.min(k - 1) as u8
}

pub unsafe fn used_count(header: *mut Header) -> u32 {
    lock(header).used_count
}

pub unsafe fn total_count(header: *mut Header) -> u32 {
    lock(header).total_count
}

pub unsafe fn is_empty(header: *mut Header) -> bool {
    lock(header).used_count == 0
}

pub unsafe fn size_class_of(header: *mut Header) -> usize {
    lock(header).size_class
}

pub unsafe fn object_size_of(header: *mut Header) -> usize {
    lock(header).object_size
}

pub unsafe fn payload_start_of(header: *mut Header) -> *mut u8 {
    lock(header).payload_start
}

pub unsafe fn map_base_of(header: *mut Header) -> *mut u8 {
    lock(header).map_base
}

pub unsafe fn map_len_of(header: *mut Header) -> usize {
    lock(header).map_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    unsafe fn alloc_aligned_superblock() -> (*mut u8, Layout) {
        let layout = Layout::from_size_align(SUPERBLOCK_SIZE, SUPERBLOCK_SIZE).unwrap();
        let raw = alloc_zeroed(layout);
        assert!(!raw.is_null());
        (raw, layout)
    }

    #[test]
    fn format_small_builds_consistent_free_list() {
        unsafe {
            let (raw, layout) = alloc_aligned_superblock();
            let header = format_small(raw, 2);
            assert!(!is_large(header));
            let total = total_count(header);
            assert!(total > 0);

            let mut popped = Vec::new();
            while let Some(p) = alloc_slot(header) {
                popped.push(p);
            }
            assert_eq!(popped.len() as u32, total);
            assert_eq!(used_count(header), total);

            for p in popped {
                free_slot(header, p);
            }
            assert_eq!(used_count(header), 0);
            dealloc(raw, layout);
        }
    }

    #[test]
    fn containing_recovers_small_header_from_any_slot_pointer() {
        unsafe {
            let (raw, layout) = alloc_aligned_superblock();
            let header = format_small(raw, 0);
            let p = alloc_slot(header).unwrap();
            assert_eq!(containing(p), Some(header));
            free_slot(header, p);
            dealloc(raw, layout);
        }
    }

    #[test]
    fn containing_rejects_foreign_pointer() {
        let mut x = 0u64;
        unsafe {
            assert_eq!(containing(&mut x as *mut u64 as *mut u8), None);
        }
    }

    #[test]
    fn format_large_recovered_by_adjacent_header() {
        unsafe {
            let size = HEADER_SIZE + 1_000_000;
            let layout = Layout::from_size_align(size, crate::limits::MAX_ALIGN_SIZE).unwrap();
            let raw = alloc_zeroed(layout);
            assert!(!raw.is_null());
            let header = format_large(raw, 1_000_000, size);
            let payload = payload_start_of(header);
            assert_eq!(containing(payload), Some(header));
            dealloc(raw, layout);
        }
    }

    #[test]
    fn emptiness_class_spans_full_range() {
        assert_eq!(emptiness_class_for(0, 100), 0);
        assert_eq!(emptiness_class_for(100, 100), (crate::limits::EMPTINESS_CLASSES - 1) as u8);
    }
}
