//! Optimistic concurrency control.
//!
//! Backends that stamp every entry with a version let the store turn an
//! `update` into a compare-and-swap against the version captured by the
//! last locking read:
//!
//! ```text
//! find_by_id(id, Lock) ──> (instance, v)
//!        mutate instance through the engine
//! update(instance)     ──> write if stored version == v
//!                          else OptimisticLock, nothing written
//! ```
//!
//! The store never retries a rejected write.  Whether to re-apply the change
//! on fresh state or abort is the engine's decision.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Precondition attached to a backend write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Last writer wins.
    Unconditional,
    /// Write only if the stored entry still carries this version.
    ExpectVersion(u64),
}

impl WriteCondition {
    /// Pick the condition for writing an instance whose last locking read
    /// captured `captured`.
    ///
    /// Backends without versioning always write unconditionally, as does an
    /// instance that was read without a lock.
    pub fn for_update(versioned_backend: bool, captured: Option<u64>) -> Self {
        match (versioned_backend, captured) {
            (true, Some(version)) => Self::ExpectVersion(version),
            (false, Some(version)) => {
                debug!(version, "backend has no versioning, ignoring captured version");
                Self::Unconditional
            }
            (_, None) => Self::Unconditional,
        }
    }

    /// Whether a write with this condition may replace an entry currently
    /// stored at `current` (`None` when the entry is absent).
    pub fn admits(self, current: Option<u64>) -> bool {
        match self {
            Self::Unconditional => true,
            Self::ExpectVersion(expected) => current == Some(expected),
        }
    }
}

/// Server-side source of version stamps.
///
/// Stamps are strictly increasing across every key, so each successful
/// write to a key observes a larger stamp than the one it replaced.
#[derive(Debug)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Allocate the next stamp.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The most recently allocated stamp, 0 if none.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}
