//! The thread-local allocation buffer: a per-thread object cache that
//! eliminates lock acquisition on the fast path for objects that stay
//! thread-private.
//!
//! A full per-class free list with an explicit byte budget, rather than
//! a single cached fast slot, since a TLAB here must itself decide when
//! to drain back to its PPH.

use core::cell::RefCell;
use core::ptr;

use crate::dispatch;
use crate::pph::PerProcessHeap;
use crate::size_class::{self, NUM_SMALL_CLASSES};
use crate::superblock;

/// The byte threshold past which a TLAB drains back to its PPH, chosen
/// generously relative to a single superblock: big enough that a thread
/// doing small-object churn rarely drains, small enough that per-thread
/// retained memory stays bounded.
pub const TLAB_BYTE_BUDGET: usize = 256 * 1024;

struct TlabNode {
    next: *mut TlabNode,
}

struct TlabState {
    pph: Option<&'static PerProcessHeap>,
    lists: [*mut TlabNode; NUM_SMALL_CLASSES],
    local_held: usize,
}

impl TlabState {
    fn new() -> Self {
        TlabState {
            pph: None,
            lists: [ptr::null_mut(); NUM_SMALL_CLASSES],
            local_held: 0,
        }
    }
}

thread_local! {
    static TLAB: RefCell<TlabState> = RefCell::new(TlabState::new());
}

fn ensure_bound(state: &mut TlabState) -> &'static PerProcessHeap {
    *state.pph.get_or_insert_with(dispatch::pph_for_current_thread)
}

/// Allocate a small object. `size` must already have been narrowed to a
/// small-object size (`size <= LARGEST_SMALL`); large requests bypass the
/// TLAB entirely and are handled by `crate::large` directly from
/// `lib.rs`.
pub unsafe fn allocate(size: usize) -> Option<*mut u8> {
    let class = size_class::size_to_class(size)?;
    TLAB.with(|cell| {
        let mut state = cell.borrow_mut();
        let pph = ensure_bound(&mut state);

        let node = state.lists[class];
        if !node.is_null() {
            state.lists[class] = (*node).next;
            state.local_held = state
                .local_held
                .saturating_sub(size_class::class_to_size(class));
            return Some(node as *mut u8);
        }

        pph.allocate(class)
    })
}

/// Free a pointer previously returned by `allocate`/the large path.
/// Large objects are dispatched straight to `crate::large` since they
/// never touch the TLAB.
pub unsafe fn free(p: *mut u8) {
    if p.is_null() {
        return;
    }
    let header = match superblock::containing(p) {
        Some(h) => h,
        None => {
            log::warn!("deallocate: pointer not owned by this allocator, ignoring");
            return;
        }
    };

    if superblock::is_large(header) {
        crate::large::large_heap().free(header);
        return;
    }

    let class = superblock::size_class_of(header);
    let class_size = size_class::class_to_size(class);

    TLAB.with(|cell| {
        let mut state = cell.borrow_mut();
        let pph = ensure_bound(&mut state);

        let owned_by_this_thread = superblock::owner_ptr(header) == pph.as_owner_ptr();

        if owned_by_this_thread && state.local_held + class_size <= TLAB_BYTE_BUDGET {
            let node = p as *mut TlabNode;
            (*node).next = state.lists[class];
            state.lists[class] = node;
            state.local_held += class_size;
        } else {
            dispatch::free_small(header, p);
            if owned_by_this_thread {
                drain_until_half(&mut state);
            }
        }
    });
}

/// Drain cached objects from the largest classes first, down to half the
/// byte budget. Large classes first because each drained object frees
/// the most bytes per owner-dispatch round trip.
unsafe fn drain_until_half(state: &mut TlabState) {
    let half = TLAB_BYTE_BUDGET / 2;
    for class in (0..NUM_SMALL_CLASSES).rev() {
        while state.local_held > half {
            let node = state.lists[class];
            if node.is_null() {
                break;
            }
            state.lists[class] = (*node).next;
            let p = node as *mut u8;
            let class_size = size_class::class_to_size(class);
            state.local_held = state.local_held.saturating_sub(class_size);
            match superblock::containing(p) {
                Some(header) => dispatch::free_small(header, p),
                None => log::warn!("tlab drain: lost header for a previously-valid pointer"),
            }
        }
        if state.local_held <= half {
            break;
        }
    }
}

/// Release every cached object back to its owner. Called both
/// explicitly (via `crate::dispatch::thread_finalize`) and, best-effort,
/// is safe to call multiple times (e.g. the embedder calling it again
/// before process `finalize`).
pub unsafe fn drain_all() {
    TLAB.with(|cell| {
        let mut state = cell.borrow_mut();
        for class in 0..NUM_SMALL_CLASSES {
            loop {
                let node = state.lists[class];
                if node.is_null() {
                    break;
                }
                state.lists[class] = (*node).next;
                let p = node as *mut u8;
                let class_size = size_class::class_to_size(class);
                state.local_held = state.local_held.saturating_sub(class_size);
                match superblock::containing(p) {
                    Some(header) => dispatch::free_small(header, p),
                    None => log::warn!("tlab drain: lost header for a previously-valid pointer"),
                }
            }
        }
        state.pph = None;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_round_trip_within_budget() {
        unsafe {
            let p = allocate(32).expect("allocate should succeed");
            free(p);
            // A second allocate of the same class should come straight
            // back off the TLAB's own free list, not the PPH.
            let p2 = allocate(32).expect("allocate should succeed");
            assert_eq!(p, p2);
            free(p2);
            drain_all();
        }
    }

    #[test]
    fn oversize_request_has_no_small_class() {
        unsafe {
            assert!(allocate(crate::limits::LARGEST_SMALL + 1).is_none());
        }
    }
}
