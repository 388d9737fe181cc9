//! The Global Heap: the single process-wide pool of empty superblocks
//! mediating between per-process heaps and the page source. A small
//! LIFO pool of recently-freed superblocks is kept around to dodge a
//! fresh `mmap` on the next allocation, trimmed back to a slop bound
//! whenever it grows past what recent demand has justified.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::limits::SUPERBLOCK_SIZE;
use crate::page_source;
use crate::superblock::{self, Header, ListLinks};
use crate::sync::SpinMutex;

/// Minimum number of empty superblocks kept around regardless of how
/// little has ever been live, so a bursty workload doesn't thrash
/// `mmap`/`munmap` right after it quiets down.
const MIN_SLOP_SUPERBLOCKS: usize = 4;

/// Fraction of `max_live_ever` past which excess empty superblocks are
/// unmapped.
const SLOP_NUM: u64 = 1;
const SLOP_DEN: u64 = 4;

struct Pool {
    head: *mut Header,
    count: usize,
}

unsafe impl Send for Pool {}

/// The process-wide Global Heap singleton.
pub struct GlobalHeap {
    pool: SpinMutex<Pool>,
    /// Bytes currently resident in superblocks owned by some PPH (i.e.
    /// not sitting in this pool). Used by [`GlobalHeap::live_pph_bytes`]
    /// to answer the `finalize` leak check.
    held_by_pph: AtomicUsize,
    /// High-water mark of `held_by_pph`, the slop bound's `max_live_ever`.
    max_live_ever: AtomicUsize,
    /// Bytes currently sitting in the empty pool, tracked separately so
    /// the slop check doesn't need the pool lock held twice.
    pool_bytes: AtomicUsize,
}

unsafe impl Sync for GlobalHeap {}

impl GlobalHeap {
    const fn new() -> Self {
        GlobalHeap {
            pool: SpinMutex::new(Pool {
                head: core::ptr::null_mut(),
                count: 0,
            }),
            held_by_pph: AtomicUsize::new(0),
            max_live_ever: AtomicUsize::new(0),
            pool_bytes: AtomicUsize::new(0),
        }
    }

    /// Pop an empty superblock and (re)initialise it for `class`,
    /// minting a fresh one from the page
    /// source if the pool is empty. Returns the still-unowned header;
    /// the caller (a PPH) is responsible for calling
    /// [`superblock::set_owner`] once it holds the header's lock.
    pub unsafe fn acquire(&self, class: usize) -> Option<*mut Header> {
        let header = {
            let mut pool = self.pool.lock();
            if pool.head.is_null() {
                None
            } else {
                let header = pool.head;
                let next = (*superblock::list_links(header)).next;
                pool.head = next;
                if !next.is_null() {
                    (*superblock::list_links(next)).prev = core::ptr::null_mut();
                }
                pool.count -= 1;
                self.pool_bytes.fetch_sub(SUPERBLOCK_SIZE, Ordering::AcqRel);
                Some(header)
            }
        };

        let header = match header {
            Some(header) => {
                if superblock::size_class_of(header) != class || superblock::is_large(header) {
                    superblock::reformat_small(header, class);
                } else {
                    // Already the right class; just make sure it reads as
                    // fully empty before being handed out.
                    debug_assert!(superblock::is_empty(header));
                }
                header
            }
            None => {
                let raw = page_source::map_aligned(SUPERBLOCK_SIZE, SUPERBLOCK_SIZE);
                if raw.is_null() {
                    log::warn!("global heap: page source exhausted minting a fresh superblock");
                    return None;
                }
                superblock::format_small(raw, class)
            }
        };

        let held = self.held_by_pph.fetch_add(SUPERBLOCK_SIZE, Ordering::AcqRel) + SUPERBLOCK_SIZE;
        self.max_live_ever.fetch_max(held, Ordering::AcqRel);
        Some(header)
    }

    /// Return a now-empty superblock to the pool, then trim the pool
    /// down to its slop bound if it has grown past it, unmapping the
    /// surplus via the page source.
    pub unsafe fn release(&self, header: *mut Header) {
        self.held_by_pph.fetch_sub(SUPERBLOCK_SIZE, Ordering::AcqRel);

        *superblock::list_links(header) = ListLinks::default();

        let mut pool = self.pool.lock();
        (*superblock::list_links(header)).next = pool.head;
        if !pool.head.is_null() {
            (*superblock::list_links(pool.head)).prev = header;
        }
        pool.head = header;
        pool.count += 1;
        self.pool_bytes.fetch_add(SUPERBLOCK_SIZE, Ordering::AcqRel);

        let bound = self.slop_bound();
        while self.pool_bytes.load(Ordering::Acquire) > bound && pool.head != core::ptr::null_mut() {
            let victim = pool.head;
            let next = (*superblock::list_links(victim)).next;
            pool.head = next;
            if !next.is_null() {
                (*superblock::list_links(next)).prev = core::ptr::null_mut();
            }
            pool.count -= 1;
            self.pool_bytes.fetch_sub(SUPERBLOCK_SIZE, Ordering::AcqRel);
            page_source::release_aligned(victim as *mut u8, SUPERBLOCK_SIZE);
            log::trace!("global heap: trimmed a surplus empty superblock");
        }
    }

    fn slop_bound(&self) -> usize {
        let constant = MIN_SLOP_SUPERBLOCKS * SUPERBLOCK_SIZE;
        let max_live = self.max_live_ever.load(Ordering::Acquire) as u64;
        let fraction = ((max_live * SLOP_NUM) / SLOP_DEN) as usize;
        constant.max(fraction)
    }

    /// Bytes currently resident in superblocks some PPH still owns.
    /// Consulted by [`crate::config::finalize`] to detect a non-empty
    /// PPH at process shutdown.
    pub fn live_pph_bytes(&self) -> usize {
        self.held_by_pph.load(Ordering::Acquire)
    }
}

static GLOBAL_HEAP: GlobalHeap = GlobalHeap::new();

pub fn global_heap() -> &'static GlobalHeap {
    &GLOBAL_HEAP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_mints_then_release_pools_it() {
        unsafe {
            let heap = GlobalHeap::new();
            let before = heap.live_pph_bytes();
            let header = heap.acquire(0).expect("page source should not fail in tests");
            assert_eq!(heap.live_pph_bytes(), before + SUPERBLOCK_SIZE);
            heap.release(header);
            assert_eq!(heap.live_pph_bytes(), before);

            // A second acquire should recycle the pooled superblock rather
            // than mint a new one from the page source.
            let header2 = heap.acquire(0).unwrap();
            assert_eq!(header, header2);
            heap.release(header2);
        }
    }

    #[test]
    fn acquire_reformats_pooled_superblock_for_new_class() {
        unsafe {
            let heap = GlobalHeap::new();
            let header = heap.acquire(0).unwrap();
            heap.release(header);
            let header2 = heap.acquire(2).unwrap();
            assert_eq!(superblock::size_class_of(header2), 2);
            heap.release(header2);
        }
    }
}
