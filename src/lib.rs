//! A scalable concurrent general-purpose memory allocator core: per-
//! thread allocation buffers over per-process size-segregated superblock
//! heaps, a shared global superblock pool, and a separate large-object
//! engine, all reachable through a handful of free functions plus a
//! [`GlobalAlloc`] adapter.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

pub mod config;
pub mod error;

mod dispatch;
mod global_heap;
mod large;
mod limits;
mod page_source;
mod pph;
mod size_class;
mod superblock;
mod sync;
mod tlab;

pub use config::Config;
pub use error::AllocatorError;

use limits::{LARGEST_SMALL, MAX_ALIGN_SIZE};

/// Install the process-wide configuration. See [`Config`].
pub fn initialize(config: Config) -> bool {
    config::initialize(config)
}

/// Drain this thread's TLAB and report any still-live per-process heaps
/// to the configured error callback.
pub fn finalize() {
    config::finalize();
}

/// Eagerly bind the calling thread to its per-process heap.
pub fn thread_initialize() {
    dispatch::thread_initialize();
}

/// Drain the calling thread's TLAB back to its per-process heap.
pub fn thread_finalize() {
    dispatch::thread_finalize();
}

/// Allocate `size` bytes at the platform's default alignment. Large
/// requests (`size > LARGEST_SMALL`) bypass the TLAB/PPH machinery
/// entirely and go straight to the large-object engine.
pub fn allocate(size: usize) -> *mut u8 {
    let size = size.max(1);
    unsafe {
        if size > LARGEST_SMALL {
            large::large_heap().allocate(size).unwrap_or(ptr::null_mut())
        } else {
            tlab::allocate(size).unwrap_or(ptr::null_mut())
        }
    }
}

/// Allocate `size` bytes aligned to `alignment`, which must be a power
/// of two. Alignments within the platform's default guarantee
/// (`MAX_ALIGN_SIZE`) are satisfied by the ordinary path; anything
/// stricter always goes through the large-object engine, which is the
/// only layer whose payload placement isn't fixed relative to its
/// region's own base.
pub fn allocate_aligned(alignment: usize, size: usize) -> *mut u8 {
    if !alignment.is_power_of_two() {
        return ptr::null_mut();
    }
    let size = size.max(1);
    unsafe {
        if alignment <= MAX_ALIGN_SIZE {
            allocate(size)
        } else {
            large::large_heap()
                .allocate_aligned(alignment, size)
                .unwrap_or(ptr::null_mut())
        }
    }
}

/// Free a pointer previously returned by `allocate`/`allocate_aligned`.
/// Silent no-op on null; silent drop on a pointer this allocator didn't
/// produce.
pub fn deallocate(pointer: *mut u8) {
    if pointer.is_null() {
        return;
    }
    unsafe {
        tlab::free(pointer);
    }
}

/// Usable size of the allocation at `pointer`. Zero if `pointer` is
/// invalid.
pub fn usable_size(pointer: *mut u8) -> usize {
    if pointer.is_null() {
        return 0;
    }
    unsafe {
        match superblock::containing(pointer) {
            Some(header) => superblock::object_size_of(header),
            None => 0,
        }
    }
}

/// The [`GlobalAlloc`] adapter: translates `Layout` into the allocator's
/// own `allocate`/`allocate_aligned`/`deallocate` surface.
pub struct ScalableAlloc;

unsafe impl GlobalAlloc for ScalableAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MAX_ALIGN_SIZE {
            allocate(layout.size())
        } else {
            allocate_aligned(layout.align(), layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        deallocate(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocation_roundtrip() {
        let p = allocate(128);
        assert!(!p.is_null());
        assert!(usable_size(p) >= 128);
        assert_eq!(p as usize % MAX_ALIGN_SIZE, 0);
        deallocate(p);
    }

    #[test]
    fn aligned_allocation_respects_alignment() {
        let p = allocate_aligned(4096, 100);
        assert!(!p.is_null());
        assert_eq!(p as usize % 4096, 0);
        assert!(usable_size(p) >= 100);
        deallocate(p);
    }

    #[test]
    fn large_allocation_roundtrip() {
        let p = allocate(1_000_000);
        assert!(!p.is_null());
        assert!(usable_size(p) >= 1_000_000);
        deallocate(p);
    }

    #[test]
    fn invalid_free_is_a_silent_no_op() {
        let mut x = 0u64;
        deallocate(&mut x as *mut u64 as *mut u8);
        deallocate(ptr::null_mut());
    }

    #[test]
    fn global_alloc_adapter_round_trips() {
        unsafe {
            let alloc = ScalableAlloc;
            let layout = Layout::from_size_align(256, 16).unwrap();
            let p = alloc.alloc(layout);
            assert!(!p.is_null());
            alloc.dealloc(p, layout);
        }
    }
}
