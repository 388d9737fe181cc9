//! The large-object engine: requests over `LARGEST_SMALL` go to a
//! separate pool keyed by the geometric size-class schedule
//! (`size_class::large_class_for`/`large_class_size`) instead of the
//! superblock/PPH machinery.
//!
//! Per-class free lists bounded by a slop policy so a program that
//! repeatedly allocates/frees large objects of similar size doesn't pay
//! a fresh `mmap`/`munmap` every time.

use core::ptr;

use crate::limits::{align_up, LARGE_SLOP_DEN, LARGE_SLOP_NUM, MAX_ALIGN_SIZE};
use crate::page_source;
use crate::size_class;
use crate::superblock::{self, Header};
use crate::sync::SpinMutex;

struct Classes {
    /// `heads[i]` is the free-list head for large class `i`, linked via
    /// each header's own `list_links.next` (single-linked is enough,
    /// unlike the PPH's rings, since large free lists are only ever
    /// pushed/popped at the head).
    heads: Vec<*mut Header>,
    /// Bytes currently handed out to callers (the slop bound's `live`).
    live_bytes: usize,
    /// Bytes currently sitting in per-class free lists, not yet released
    /// to the page source.
    cached_bytes: usize,
}

unsafe impl Send for Classes {}

/// The process-wide large-object pool singleton, mirroring the Global
/// Heap's single-instance treatment for small superblocks.
pub struct LargeHeap {
    classes: SpinMutex<Classes>,
}

unsafe impl Sync for LargeHeap {}

impl LargeHeap {
    const fn new() -> Self {
        LargeHeap {
            classes: SpinMutex::new(Classes {
                heads: Vec::new(),
                live_bytes: 0,
                cached_bytes: 0,
            }),
        }
    }

    /// Allocate a large object of at least `size` bytes.
    pub unsafe fn allocate(&self, size: usize) -> Option<*mut u8> {
        let class = size_class::large_class_for(size) as usize;
        let class_size = size_class::large_class_size(class as u32);

        let reused = {
            let mut classes = self.classes.lock();
            if classes.heads.len() <= class {
                classes.heads.resize(class + 1, ptr::null_mut());
            }
            let head = classes.heads[class];
            if head.is_null() {
                None
            } else {
                let next = (*superblock::list_links(head)).next;
                classes.heads[class] = next;
                classes.cached_bytes = classes.cached_bytes.saturating_sub(class_size);
                classes.live_bytes += class_size;
                Some(head)
            }
        };

        let header = match reused {
            Some(h) => h,
            None => {
                let header_size = core::mem::size_of::<Header>();
                let total = align_up(header_size + class_size, MAX_ALIGN_SIZE);
                let raw = page_source::map_aligned(total, MAX_ALIGN_SIZE);
                if raw.is_null() {
                    log::warn!("large heap: page source exhausted allocating {} bytes", total);
                    return None;
                }
                let header = superblock::format_large(raw, class_size, total);
                let mut classes = self.classes.lock();
                classes.live_bytes += class_size;
                header
            }
        };

        Some(superblock::payload_start_of(header))
    }

    /// Allocate a large object with alignment exceeding `MAX_ALIGN_SIZE`:
    /// minted directly, never pulled from the per-class free lists, since
    /// a reused object's alignment is whatever it was originally minted
    /// with. Over-allocates by `alignment` bytes and places the header
    /// immediately before the first aligned byte.
    pub unsafe fn allocate_aligned(&self, alignment: usize, size: usize) -> Option<*mut u8> {
        let header_size = core::mem::size_of::<Header>();
        let total = align_up(header_size + alignment + size, MAX_ALIGN_SIZE);
        let raw = page_source::map_aligned(total, MAX_ALIGN_SIZE);
        if raw.is_null() {
            log::warn!(
                "large heap: page source exhausted allocating {} aligned bytes",
                total
            );
            return None;
        }
        let header = superblock::format_large_aligned(raw, size, alignment, raw, total);
        {
            let mut classes = self.classes.lock();
            classes.live_bytes += size;
        }
        Some(superblock::payload_start_of(header))
    }

    /// `deallocate` dispatch target for a large object. Pushes it onto
    /// its class's free list, then enforces the slop
    /// bound: when cached bytes exceed `(1 + eps') x live`, every cached
    /// large object is released back to the page source.
    pub unsafe fn free(&self, header: *mut Header) {
        let object_size = superblock::object_size_of(header);
        let class = size_class::large_class_for(object_size) as usize;

        let mut to_release: Vec<(*mut u8, usize)> = Vec::new();
        {
            let mut classes = self.classes.lock();
            classes.live_bytes = classes.live_bytes.saturating_sub(object_size);

            if classes.heads.len() <= class {
                classes.heads.resize(class + 1, ptr::null_mut());
            }
            {
                let links = superblock::list_links(header);
                (*links).next = classes.heads[class];
                (*links).prev = ptr::null_mut();
            }
            classes.heads[class] = header;
            classes.cached_bytes += object_size;

            let cached = classes.cached_bytes as u64;
            let live = classes.live_bytes as u64;
            if cached * LARGE_SLOP_DEN > live * LARGE_SLOP_NUM {
                for head in classes.heads.iter_mut() {
                    let mut cur = *head;
                    while !cur.is_null() {
                        let next = (*superblock::list_links(cur)).next;
                        let guard = superblock::lock(cur);
                        to_release.push((guard.map_base, guard.map_len));
                        drop(guard);
                        cur = next;
                    }
                    *head = ptr::null_mut();
                }
                classes.cached_bytes = 0;
            }
        }

        for (base, len) in to_release {
            page_source::release_aligned(base, len);
            log::trace!("large heap: released a cached large object ({} bytes)", len);
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.classes.lock().live_bytes
    }
}

static LARGE_HEAP: LargeHeap = LargeHeap::new();

pub fn large_heap() -> &'static LargeHeap {
    &LARGE_HEAP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_free_recycles_same_class() {
        unsafe {
            let heap = LargeHeap::new();
            let p = heap.allocate(1_000_000).expect("page source should not fail");
            let header = superblock::containing(p).unwrap();
            assert!(superblock::is_large(header));
            assert!(superblock::object_size_of(header) >= 1_000_000);

            heap.free(header);
            let p2 = heap.allocate(1_000_000).unwrap();
            let header2 = superblock::containing(p2).unwrap();
            assert_eq!(header, header2, "same-class reuse should recycle the freed header");
            heap.free(header2);
        }
    }

    #[test]
    fn exceeding_slop_bound_releases_cache() {
        unsafe {
            let heap = LargeHeap::new();
            let p = heap.allocate(500_000).unwrap();
            let header = superblock::containing(p).unwrap();
            heap.free(header);
            // live_bytes is now 0 and cached_bytes > 0: any positive cache
            // exceeds a zero slop bound, so the free list should be empty.
            let classes = heap.classes.lock();
            assert_eq!(classes.cached_bytes, 0);
        }
    }
}
