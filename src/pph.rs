//! The Per-Process Heap: an array of size-class bins, each a set of
//! emptiness rings, serving small-object allocation and free with a
//! Hoard-style emptiness-threshold reclamation policy.

use core::ptr;

use crate::global_heap;
use crate::limits::{EMPTINESS_CLASSES, SUPERBLOCK_SIZE};
use crate::size_class::NUM_SMALL_CLASSES;
use crate::superblock::{self, Header, Inner, ListLinks, OwnerKind};
use crate::sync::SpinMutex;

#[derive(Clone, Copy)]
struct Bin {
    /// The "manage-one" cached superblock: allocation is tried here first
    /// before consulting the rings.
    current: *mut Header,
    /// `rings[e]` is the head of the doubly-linked ring of superblocks
    /// at emptiness class `e`, linked via each superblock's own
    /// `list_links`, synchronized by this PPH's own lock rather than by
    /// any superblock's lock.
    rings: [*mut Header; EMPTINESS_CLASSES],
}

impl Bin {
    const fn empty() -> Self {
        Bin {
            current: ptr::null_mut(),
            rings: [ptr::null_mut(); EMPTINESS_CLASSES],
        }
    }
}

struct PphInner {
    bins: [Bin; NUM_SMALL_CLASSES],
    /// `U` in the reclamation predicate: bytes in use across every size
    /// class this PPH owns.
    bytes_in_use: usize,
    /// `A` in the reclamation predicate: bytes held (superblock count ×
    /// `S`) across every size class this PPH owns.
    bytes_held: usize,
}

unsafe impl Send for PphInner {}

/// One of the `N` per-process heaps threads are hashed onto. Protected by
/// a single lock covering every bin.
pub struct PerProcessHeap {
    inner: SpinMutex<PphInner>,
}

unsafe impl Sync for PerProcessHeap {}

impl PerProcessHeap {
    pub const fn new() -> Self {
        PerProcessHeap {
            inner: SpinMutex::new(PphInner {
                bins: [Bin::empty(); NUM_SMALL_CLASSES],
                bytes_in_use: 0,
                bytes_held: 0,
            }),
        }
    }

    /// An opaque identity for this PPH suitable for storing in a
    /// superblock header's `owner_ptr`. Valid for the process lifetime
    /// since every `PerProcessHeap` lives in a `'static` array (see
    /// `crate::dispatch`).
    pub fn as_owner_ptr(&self) -> *mut () {
        self as *const Self as *mut ()
    }

    /// Allocate one slot of `class` from this PPH, minting or recycling a
    /// superblock as needed.
    pub unsafe fn allocate(&self, class: usize) -> Option<*mut u8> {
        loop {
            let mut locked = self.inner.lock();

            let current = locked.bins[class].current;
            if !current.is_null() {
                if let Some(p) = superblock::alloc_slot(current) {
                    let object_size = superblock::object_size_of(current);
                    locked.bytes_in_use += object_size;
                    return Some(p);
                }
                // Current is exhausted: park it at the full end of the
                // ring and go looking for a replacement.
                ring_push_front(&mut locked.bins[class], EMPTINESS_CLASSES - 1, current);
                locked.bins[class].current = ptr::null_mut();
            }

            // Scan fullest-ring-first for a replacement, but a ring can
            // hold a superblock with literally zero free slots (one we
            // just parked above), so walk past those instead of
            // re-selecting them — otherwise the only occupant of the
            // full ring would be handed right back out and immediately
            // re-parked forever.
            let mut replacement = None;
            'scan: for e in (0..EMPTINESS_CLASSES).rev() {
                let mut cur = locked.bins[class].rings[e];
                while !cur.is_null() {
                    let next = (*superblock::list_links(cur)).next;
                    if superblock::has_free_slot(cur) {
                        ring_unlink_at(&mut locked.bins[class], e, cur);
                        replacement = Some(cur);
                        break 'scan;
                    }
                    cur = next;
                }
            }

            if let Some(header) = replacement {
                locked.bins[class].current = header;
                continue;
            }

            // Bin fully empty. Drop the PPH lock before the potentially
            // slow Global Heap / page source call, then reacquire: the
            // PPH -> superblock lock ordering doesn't require holding
            // the PPH lock across a superblock mint.
            drop(locked);
            let header = global_heap::global_heap().acquire(class)?;
            {
                let mut guard = superblock::lock(header);
                superblock::set_owner(header, &mut guard, OwnerKind::Pph, self.as_owner_ptr());
            }
            let mut locked = self.inner.lock();
            locked.bytes_held += SUPERBLOCK_SIZE;
            locked.bins[class].current = header;
        }
    }

    /// The owner-dispatch free path, called by `crate::dispatch` once it
    /// holds `header`'s lock and has confirmed this PPH is the current
    /// owner. Returns `true` if the
    /// reclamation predicate fired and `header` has been detached and
    /// handed off to the Global Heap — the caller must release both the
    /// superblock lock and this PPH's (already-dropped) lock before
    /// actually calling `global_heap().release(header)`, since that call
    /// re-locks the header itself.
    pub unsafe fn free_object(&self, header: *mut Header, p: *mut u8, guard: &mut Inner) -> bool {
        let class = guard.size_class;
        let object_size = guard.object_size;
        let old_emptiness = guard.emptiness_class as usize;

        superblock::free_slot_locked(guard, p);

        let new_emptiness = guard.emptiness_class as usize;
        let now_empty = guard.used_count == 0;

        let mut locked = self.inner.lock();
        locked.bytes_in_use = locked.bytes_in_use.saturating_sub(object_size);

        let is_current = locked.bins[class].current == header;
        if !is_current && old_emptiness != new_emptiness {
            ring_unlink_at(&mut locked.bins[class], old_emptiness, header);
            ring_push_front(&mut locked.bins[class], new_emptiness, header);
        }

        if !now_empty || !reclamation_predicate(locked.bytes_in_use, locked.bytes_held, object_size) {
            return false;
        }

        if is_current {
            locked.bins[class].current = ptr::null_mut();
        } else {
            ring_unlink_at(&mut locked.bins[class], new_emptiness, header);
        }
        locked.bytes_held = locked.bytes_held.saturating_sub(SUPERBLOCK_SIZE);
        superblock::set_owner(header, guard, OwnerKind::Global, ptr::null_mut());
        true
    }

    pub fn bytes_in_use(&self) -> usize {
        self.inner.lock().bytes_in_use
    }

    pub fn bytes_held(&self) -> usize {
        self.inner.lock().bytes_held
    }
}

/// The reclamation predicate: `K*U < (K-1)*A AND U < A - 2*S/object_size`.
fn reclamation_predicate(used: usize, held: usize, object_size: usize) -> bool {
    if held == 0 || object_size == 0 {
        return false;
    }
    let k = EMPTINESS_CLASSES as u64;
    let u = used as u64;
    let a = held as u64;
    let first = k * u < (k - 1) * a;
    let slack = 2 * SUPERBLOCK_SIZE as u64 / object_size as u64;
    let second = u < a.saturating_sub(slack);
    first && second
}

/// Unlink `header` from ring `e`. `list_links` is synchronized by this
/// PPH's own lock (already held by every caller), so splicing never
/// needs to lock `header` or either of its ring neighbors.
unsafe fn ring_unlink_at(bin: &mut Bin, e: usize, header: *mut Header) {
    let links = &mut *superblock::list_links(header);
    let prev = links.prev;
    let next = links.next;
    if prev.is_null() {
        bin.rings[e] = next;
    } else {
        (*superblock::list_links(prev)).next = next;
    }
    if !next.is_null() {
        (*superblock::list_links(next)).prev = prev;
    }
    *links = ListLinks::default();
}

unsafe fn ring_push_front(bin: &mut Bin, e: usize, header: *mut Header) {
    let old_head = bin.rings[e];
    let links = &mut *superblock::list_links(header);
    links.prev = ptr::null_mut();
    links.next = old_head;
    if !old_head.is_null() {
        (*superblock::list_links(old_head)).prev = header;
    }
    bin.rings[e] = header;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_free_round_trips_through_reclamation() {
        unsafe {
            let pph = PerProcessHeap::new();
            let mut allocated = Vec::new();
            for _ in 0..64 {
                let p = pph.allocate(0).expect("allocate should succeed");
                allocated.push(p);
            }
            assert!(pph.bytes_in_use() > 0);

            for p in allocated {
                let header = superblock::containing(p).expect("must resolve to a header");
                let mut guard = superblock::lock(header);
                let reclaimed = pph.free_object(header, p, &mut guard);
                drop(guard);
                if reclaimed {
                    global_heap::global_heap().release(header);
                }
            }
            assert_eq!(pph.bytes_in_use(), 0);
        }
    }

    #[test]
    fn reclamation_predicate_requires_low_utilization_and_headroom() {
        // Mostly full: should not reclaim.
        assert!(!reclamation_predicate(90, 100, 16));
        // Mostly empty with ample headroom: should reclaim.
        assert!(reclamation_predicate(0, 10 * SUPERBLOCK_SIZE, 16));
    }
}
