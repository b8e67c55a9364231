use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier correlating an outbound request with its response.
///
/// Identifiers are plain integers on the wire. They are allocated by a
/// [`CallIdGenerator`] and are never reused for the lifetime of a
/// connection, so a delayed or duplicated response can never be matched
/// against a newer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    // ---

    /// Wrap a raw identifier, e.g. one read back from the wire.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    // ---

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for CallId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Monotonic allocator for [`CallId`]s.
///
/// The first identifier handed out is `1`. The counter only moves forward;
/// completion of a call does not return its identifier to the pool.
#[derive(Debug)]
pub struct CallIdGenerator {
    next: AtomicU64,
}

impl CallIdGenerator {
    // ---

    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next identifier.
    pub fn next_id(&self) -> CallId {
        CallId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CallIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
