//! Request id allocation for multiplexed sessions.
//!
//! A client that wants to run several logical sessions over one transport
//! tags each command with a [`RequestId`].  The server echoes the id on the
//! matching `response` or `error`, which lets the client route the reply even
//! when replies for different sessions interleave.
//!
//! # Thread safety
//!
//! The counter is an `AtomicU64`.  Two tasks calling `next()` at the same time
//! never receive the same id, and no lock is taken.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::messages::RequestId;

/// Monotonically increasing source of request ids, starting at 1.
///
/// # Examples
///
/// ```rust
/// use wcp_core::protocol::RequestIdCounter;
///
/// let ids = RequestIdCounter::new();
/// assert_eq!(ids.next(), 1);
/// assert_eq!(ids.next(), 2);
/// ```
#[derive(Debug)]
pub struct RequestIdCounter {
    inner: AtomicU64,
}

impl RequestIdCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns a fresh id.  Wraps from `u64::MAX` to 0 without panicking.
    ///
    /// `Relaxed` is enough: ids only need to be unique, they do not order
    /// any other memory access.
    pub fn next(&self) -> RequestId {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> RequestId {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for RequestIdCounter {
    fn default() -> Self {
        Self::new()
    }
}
