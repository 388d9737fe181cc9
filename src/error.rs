//! Error taxonomy.
//!
//! Every internal error converts to a null return or a silent drop at the
//! public boundary — there are no exceptions or unwinds inside the
//! allocator. This enum exists purely for internal control flow and to
//! describe what happened when the error callback configured via
//! [`crate::config::Config`] is invoked.

use core::fmt;

/// Taxonomy of conditions the allocator can encounter.
///
/// `DoubleFree` is listed for completeness but this core has no debug
/// canary layer, so it is never actually detected or constructed; a
/// double free is undefined behavior here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorError {
    /// The page source failed to map the requested region.
    OutOfMemory,
    /// `deallocate` was called with a pointer this allocator did not issue
    /// (the superblock/large-object magic check failed).
    InvalidFree,
    /// `finalize` found a per-process heap that still holds live bytes.
    LeakOnFinalize,
}

impl fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorError::OutOfMemory => write!(f, "page source exhausted: map() failed"),
            AllocatorError::InvalidFree => {
                write!(f, "deallocate() called with a pointer not owned by this allocator")
            }
            AllocatorError::LeakOnFinalize => {
                write!(f, "finalize() found live allocations still outstanding")
            }
        }
    }
}

/// Signature of the user-supplied diagnostic callback, set via
/// `Config::error_callback`.
///
/// Invoked for leaks and other non-fatal anomalies; never invoked on the
/// allocation fast path. The allocator does not act on the callback's
/// return value — it exists purely for the embedder to log or assert.
pub type ErrorCallback = fn(AllocatorError, &str);

/// Default callback used when the embedder doesn't supply one: forward
/// to `log::error!`, the same crate used elsewhere in this allocator for
/// reporting OS-level failures.
pub fn log_error_callback(kind: AllocatorError, message: &str) {
    log::error!("{}: {}", kind, message);
}
