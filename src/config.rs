//! Process-lifetime configuration and initialization state.
//!
//! A one-shot `initialize`/`finalize` pair, without any constructor-
//! attribute or `atexit` dispatch at its tail: wiring the allocator into
//! process startup/shutdown is a process-entry-shim concern, left to the
//! embedder. Embedders call [`initialize`] and [`finalize`] explicitly,
//! the same way they'd call `thread_initialize`/`thread_finalize` (see
//! `crate::dispatch`).

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::error::{log_error_callback, AllocatorError, ErrorCallback};

/// Options accepted by [`initialize`].
#[derive(Clone, Copy)]
pub struct Config {
    /// Invoked for leaks or assertion-like failures with a message string.
    pub error_callback: ErrorCallback,
    /// Whether pages backing superblocks should be mapped executable.
    /// Always `false` for this core: JIT/executable-heap support is out
    /// of scope.
    pub executable_heap: bool,
    /// Advisory upper bound on concurrent threads; used only to size the
    /// PPH hash arity sensibly, never enforced as a hard cap.
    pub max_threads: usize,
    /// Number of per-process heaps (`N`). Must be a power of two;
    /// thread -> PPH is `hash(tid) & (N-1)`.
    pub num_heaps: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            error_callback: log_error_callback,
            executable_heap: false,
            max_threads: 256,
            num_heaps: 8,
        }
    }
}

impl Config {
    /// Validate and normalize a user-supplied config. `num_heaps` is
    /// rounded up to the next power of two if it isn't one already,
    /// rather than rejected outright, since any positive value implies a
    /// usable (if suboptimal) arity.
    fn normalized(mut self) -> Self {
        if self.num_heaps == 0 {
            self.num_heaps = 1;
        }
        if !self.num_heaps.is_power_of_two() {
            self.num_heaps = self.num_heaps.next_power_of_two();
        }
        if self.max_threads == 0 {
            self.max_threads = 1;
        }
        self
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static NUM_HEAPS: AtomicUsize = AtomicUsize::new(8);
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// Install `config` as the process-wide configuration. Idempotent: a
/// second call is a no-op that returns `true` without altering the
/// already-installed config.
pub fn initialize(config: Config) -> bool {
    let config = config.normalized();
    if INITIALIZED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        NUM_HEAPS.store(config.num_heaps, Ordering::Release);
        let _ = GLOBAL_CONFIG.set(config);
        log::debug!(
            "allocator initialized: num_heaps={}, max_threads={}",
            config.num_heaps,
            config.max_threads
        );
    }
    true
}

/// Read the active configuration, initializing with defaults on first
/// use if the embedder never called [`initialize`] explicitly — the
/// public `allocate`/`deallocate` entry points must work even for a
/// process that never called `initialize`, since it's an optional
/// lifetime hook, not a precondition for `allocate`.
pub fn config() -> &'static Config {
    if !INITIALIZED.swap(true, Ordering::AcqRel) {
        let config = Config::default().normalized();
        NUM_HEAPS.store(config.num_heaps, Ordering::Release);
        let _ = GLOBAL_CONFIG.set(config);
    }
    GLOBAL_CONFIG.get_or_init(Config::default)
}

pub fn num_heaps() -> usize {
    NUM_HEAPS.load(Ordering::Acquire)
}

/// Drains the thread-local allocation buffer of the calling thread and
/// then asks every per-process heap to report any superblocks it still
/// owns. A non-empty PPH invokes the error callback with
/// `LeakOnFinalize` rather than aborting, since this core has no way to
/// know whether the embedder is really shutting down or just collecting
/// statistics mid-run.
pub fn finalize() {
    crate::dispatch::thread_finalize();
    let leaked = crate::global_heap::global_heap().live_pph_bytes();
    if leaked > 0 {
        let cb = config().error_callback;
        cb(
            AllocatorError::LeakOnFinalize,
            &format!("{} bytes still live across per-process heaps", leaked),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_heaps_rounds_up_to_power_of_two() {
        let c = Config {
            num_heaps: 6,
            ..Config::default()
        }
        .normalized();
        assert_eq!(c.num_heaps, 8);
    }

    #[test]
    fn zero_num_heaps_becomes_one() {
        let c = Config {
            num_heaps: 0,
            ..Config::default()
        }
        .normalized();
        assert_eq!(c.num_heaps, 1);
    }
}
