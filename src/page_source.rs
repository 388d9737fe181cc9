//! The page-level memory source: the boundary between this allocator and
//! the operating system's virtual memory API.
//!
//! `mmap`/`munmap` via `libc` on unix, `VirtualAlloc`/`VirtualFree` via
//! `winapi` on Windows, plus an over-allocate-then-trim strategy for
//! aligned mappings (the common case being a direct-mapped region that's
//! already aligned, falling back to the trim dance only when it isn't).

use core::ptr;
use std::sync::OnceLock;

use crate::limits::align_up;
use crate::sync::SpinMutex;

#[cfg(not(windows))]
use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_PRIVATE, MAP_FAILED, PROT_READ, PROT_WRITE};
#[cfg(windows)]
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
#[cfg(windows)]
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

fn os_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(not(windows))]
        unsafe {
            let n = libc::sysconf(libc::_SC_PAGESIZE);
            if n > 0 {
                n as usize
            } else {
                4096
            }
        }
        #[cfg(windows)]
        unsafe {
            let mut info: winapi::um::sysinfoapi::SYSTEM_INFO = core::mem::zeroed();
            winapi::um::sysinfoapi::GetSystemInfo(&mut info);
            info.dwPageSize.max(4096) as usize
        }
    })
}

fn good_alloc_size(size: usize) -> usize {
    align_up(size, os_page_size())
}

/// Raw, possibly-unaligned map of `size` bytes from the OS, zero-
/// initialized, committed for read/write immediately.
unsafe fn raw_map(size: usize) -> *mut u8 {
    #[cfg(not(windows))]
    {
        let p = mmap(
            ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == MAP_FAILED {
            log::warn!("mmap failed for {} bytes: {}", size, errno::errno());
            ptr::null_mut()
        } else {
            p as *mut u8
        }
    }
    #[cfg(windows)]
    {
        let p = VirtualAlloc(
            ptr::null_mut(),
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        );
        if p.is_null() {
            log::warn!(
                "VirtualAlloc failed for {} bytes: error {}",
                size,
                winapi::um::errhandlingapi::GetLastError()
            );
        }
        p as *mut u8
    }
}

unsafe fn raw_release(p: *mut u8, size: usize) {
    if p.is_null() || size == 0 {
        return;
    }
    #[cfg(not(windows))]
    {
        if munmap(p as *mut _, size) != 0 {
            log::warn!("munmap failed for {:p}, {} bytes: {}", p, size, errno::errno());
        }
    }
    #[cfg(windows)]
    {
        // Windows requires releasing the exact base returned by
        // VirtualAlloc with size 0 and MEM_RELEASE.
        if VirtualFree(p as *mut _, 0, MEM_RELEASE) == 0 {
            log::warn!(
                "VirtualFree failed for {:p}: error {}",
                p,
                winapi::um::errhandlingapi::GetLastError()
            );
        }
    }
}

/// Map `n` bytes rounded up to a page multiple, page-aligned,
/// zero-initialized. Returns null on failure.
pub fn map(n: usize) -> *mut u8 {
    if n == 0 {
        return ptr::null_mut();
    }
    let size = good_alloc_size(n);
    unsafe { raw_map(size) }
}

/// Undo a prior `map`/`map_aligned`.
pub fn release(p: *mut u8, n: usize) {
    if p.is_null() || n == 0 {
        return;
    }
    let size = good_alloc_size(n);
    unsafe { raw_release(p, size) }
}

/// Bookkeeping for outstanding aligned maps, so `release` can pass the OS
/// the exact granted size (we may have trimmed a larger over-allocation
/// down to `align`). Backed by a tiny bump allocator over page-source
/// memory so recording an entry never recurses into the main allocator.
struct AlignedMapEntry {
    base: *mut u8,
    size: usize,
    next: *mut AlignedMapEntry,
}

struct BumpArena {
    chunk: *mut u8,
    chunk_len: usize,
    used: usize,
    head: *mut AlignedMapEntry,
}

impl BumpArena {
    const fn new() -> Self {
        BumpArena {
            chunk: ptr::null_mut(),
            chunk_len: 0,
            used: 0,
            head: ptr::null_mut(),
        }
    }

    unsafe fn record(&mut self, base: *mut u8, size: usize) {
        let need = core::mem::size_of::<AlignedMapEntry>();
        if self.chunk.is_null() || self.used + need > self.chunk_len {
            // A page of bookkeeping space amortizes over many aligned
            // maps; this is page-source memory, entirely separate from
            // the main small/large object heaps, so it never recurses.
            let len = os_page_size();
            let chunk = raw_map(len);
            self.chunk = chunk;
            self.chunk_len = len;
            self.used = 0;
        }
        if self.chunk.is_null() {
            return; // bookkeeping is best-effort; release() falls back below.
        }
        let slot = self.chunk.add(self.used) as *mut AlignedMapEntry;
        self.used += need;
        ptr::write(
            slot,
            AlignedMapEntry {
                base,
                size,
                next: self.head,
            },
        );
        self.head = slot;
    }

    unsafe fn take(&mut self, base: *mut u8) -> Option<usize> {
        let mut prev: *mut AlignedMapEntry = ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            if (*cur).base == base {
                let size = (*cur).size;
                if prev.is_null() {
                    self.head = (*cur).next;
                } else {
                    (*prev).next = (*cur).next;
                }
                return Some(size);
            }
            prev = cur;
            cur = (*cur).next;
        }
        None
    }
}

unsafe impl Send for BumpArena {}

static ALIGNED_MAP_BOOKKEEPING: SpinMutex<BumpArena> = SpinMutex::new(BumpArena::new());

/// Map a region whose base address is a multiple of `align` (the
/// allocator's main use is `align == SUPERBLOCK_SIZE`). Implemented by
/// mapping `size + align` bytes, trimming the unaligned prefix and the
/// remaining suffix.
pub fn map_aligned(size: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    let size = good_alloc_size(size);
    let align = align_up(align, os_page_size());

    unsafe {
        // Try the cheap path first: plain `map` is already aligned more
        // often than not on 64-bit address spaces with ASLR-free
        // low-fragmentation layouts; only pay for the over-allocation
        // dance when it isn't.
        let p = raw_map(size);
        if p.is_null() {
            return ptr::null_mut();
        }
        if (p as usize) % align == 0 {
            return p;
        }
        raw_release(p, size);

        if size >= usize::MAX - align {
            return ptr::null_mut(); // overflow guard
        }
        let over_size = size + align;
        let over = raw_map(over_size);
        if over.is_null() {
            return ptr::null_mut();
        }
        let aligned = align_up(over as usize, align) as *mut u8;
        let pre_size = aligned as usize - over as usize;
        let mid_size = size;
        let post_size = over_size - pre_size - mid_size;

        if pre_size > 0 {
            raw_release(over, pre_size);
        }
        if post_size > 0 {
            raw_release(aligned.add(mid_size), post_size);
        }
        ALIGNED_MAP_BOOKKEEPING.lock().record(aligned, size);
        aligned
    }
}

/// Release a region obtained from [`map_aligned`]. Looks up the exact
/// granted size recorded at map time rather than trusting the caller, in
/// case trimming shrank it below `size`.
pub fn release_aligned(p: *mut u8, size_hint: usize) {
    if p.is_null() {
        return;
    }
    unsafe {
        let size = ALIGNED_MAP_BOOKKEEPING
            .lock()
            .take(p)
            .unwrap_or_else(|| good_alloc_size(size_hint));
        raw_release(p, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_zeroes_memory() {
        let p = map(4096);
        assert!(!p.is_null());
        unsafe {
            for i in 0..4096 {
                assert_eq!(*p.add(i), 0);
            }
        }
        release(p, 4096);
    }

    #[test]
    fn map_aligned_respects_alignment() {
        let align = crate::limits::SUPERBLOCK_SIZE;
        let p = map_aligned(align, align);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0);
        release_aligned(p, align);
    }

    #[test]
    fn map_null_for_zero_size() {
        assert!(map(0).is_null());
    }
}
