//! Session id allocation.
//!
//! The server assigns every accepted client a small integer id, unique for
//! the server process's lifetime and monotonically increasing. Unicast sends
//! and forced disconnects address sessions by this id.
//!
//! # Thread safety
//!
//! The allocator uses an `AtomicU32`, so the accept loop and any diagnostic
//! reader can share it without a lock: `fetch_add` reserves an id as a
//! single indivisible step, and two concurrent allocations can never receive
//! the same value.

use std::sync::atomic::{AtomicU32, Ordering};

/// Server-assigned integer identifying one client session.
pub type ClientId = u32;

/// Thread-safe, monotonically increasing allocator for [`ClientId`]s.
///
/// Ids start at 1 so that 0 never names a real session and can serve as an
/// obvious "unassigned" value in logs and diagnostics.
///
/// # Examples
///
/// ```rust
/// use cmdlink_core::session::ids::IdAllocator;
///
/// let allocator = IdAllocator::new();
/// assert_eq!(allocator.next(), 1);
/// assert_eq!(allocator.next(), 2);
/// ```
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    /// Creates an allocator whose first id is 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Reserves and returns the next id.
    ///
    /// `Relaxed` ordering suffices: ids only need to be unique, not to
    /// synchronize any other memory.
    pub fn next(&self) -> ClientId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`IdAllocator::next`] would return. Another
    /// thread may claim it first; use for diagnostics only.
    pub fn peek(&self) -> ClientId {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
