//! Mutual exclusion primitive: short bounded spins alternating with
//! OS-level yields.
//!
//! Guards superblock headers, PPH bins, and the global heap pool. A
//! hand-rolled spinlock rather than a new dependency, with the same
//! `#[cfg(windows)]` via `winapi` / unix via `libc` platform split used
//! elsewhere in this crate for OS calls.
//!
//! Deliberately simple: a handful of spins on a relaxed load, then
//! falling back to `sched_yield`/`SwitchToThread`. Not fair and not a
//! general-purpose mutex; contention on these locks is expected to stay
//! short and bounded (fine-grained per-superblock locks, rare
//! global-heap promotions).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

const SPIN_ATTEMPTS: u32 = 40;

#[inline]
fn os_yield() {
    #[cfg(windows)]
    unsafe {
        winapi::um::processthreadsapi::SwitchToThread();
    }
    #[cfg(not(windows))]
    unsafe {
        libc::sched_yield();
    }
}

/// A short spinlock with an OS-yield fallback, guarding a `T`.
///
/// Used for the per-superblock lock, the per-PPH lock, and the single
/// global-heap lock.
pub struct SpinMutex<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        SpinMutex {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning briefly before yielding to the OS
    /// scheduler. Lock acquisition order for callers that hold more than
    /// one of these locks at once must follow `superblock -> owner-heap`;
    /// this type does not enforce that itself, it is the caller's
    /// responsibility.
    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let mut spins = 0u32;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if spins < SPIN_ATTEMPTS {
                core::hint::spin_loop();
                spins += 1;
            } else {
                os_yield();
            }
        }
        SpinMutexGuard { lock: self }
    }

}

pub struct SpinMutexGuard<'a, T> {
    lock: &'a SpinMutex<T>,
}

impl<'a, T> Deref for SpinMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for SpinMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for SpinMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion_under_contention() {
        let counter = Arc::new(SpinMutex::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *counter.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 8000);
    }

    #[test]
    fn lock_is_reentrant_safe_after_drop() {
        let m = SpinMutex::new(1);
        {
            let mut guard = m.lock();
            *guard += 1;
        }
        assert_eq!(*m.lock(), 2);
    }
}
