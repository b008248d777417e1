//! Storage backends.
//!
//! A backend stores opaque framed bytes under `(namespace, key)`, where the
//! namespace is the process id and the key the instance id.  Two strategies
//! ship with the crate:
//!
//! - [`VersionedCacheBackend`]: cache-style store with server-assigned
//!   version stamps, atomic put-if-absent and replace-with-version.
//! - [`EmbeddedBackend`]: SQLite-backed ordered store without versioning,
//!   meant for single-process, single-writer deployments.
//!
//! Scans hand out a [`RecordCursor`] that pages through the namespace.  The
//! cursor owns a [`CursorGuard`]; dropping the cursor on any path releases
//! it, and [`StorageBackend::open_cursors`] reports how many are still live.

pub mod cache;
pub mod embedded;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::concurrency::WriteCondition;
use crate::error::StoreResult;

pub use cache::VersionedCacheBackend;
pub use embedded::EmbeddedBackend;

/// Raw bytes plus the backend's version stamp, if it keeps one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub payload: Vec<u8>,
    pub version: Option<u64>,
}

/// One page of a scan: `(key, record)` pairs.
pub type Page = Vec<(String, StoredRecord)>;

/// Key-value persistence for framed instance bytes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether entries carry version stamps usable for compare-and-swap.
    fn supports_versioning(&self) -> bool;

    /// Store `payload` only if `key` is absent, atomically.
    ///
    /// Returns the assigned version, or `StoreError::DuplicateId`.
    async fn insert_if_absent(
        &self,
        namespace: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> StoreResult<Option<u64>>;

    /// Store `payload` under `key` if `condition` admits the current entry.
    ///
    /// Returns the new version, or `StoreError::OptimisticLock` with the
    /// stored entry left untouched.
    async fn write(
        &self,
        namespace: &str,
        key: &str,
        payload: Vec<u8>,
        condition: WriteCondition,
    ) -> StoreResult<Option<u64>>;

    /// Read the entry under `key`.
    async fn read(&self, namespace: &str, key: &str) -> StoreResult<Option<StoredRecord>>;

    /// Delete the entry under `key`; returns whether one existed.
    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool>;

    /// Whether an entry exists under `key`, without reading its payload.
    async fn contains(&self, namespace: &str, key: &str) -> StoreResult<bool>;

    /// Number of entries in `namespace`.
    async fn count(&self, namespace: &str) -> StoreResult<u64>;

    /// Open a forward cursor over `namespace`, `page_size` entries per page.
    async fn scan(&self, namespace: &str, page_size: usize) -> StoreResult<Box<dyn RecordCursor>>;

    /// Cursors handed out by [`scan`](Self::scan) that are still alive.
    fn open_cursors(&self) -> usize;
}

/// Forward-only, paged cursor over a namespace.
#[async_trait]
pub trait RecordCursor: Send {
    /// Fetch the next page; an empty page means the scan is exhausted.
    async fn next_page(&mut self) -> StoreResult<Page>;
}

// ---------------------------------------------------------------------------
// Cursor tracking
// ---------------------------------------------------------------------------

/// Counts cursors opened by a backend.
#[derive(Debug, Clone, Default)]
pub struct CursorTracker {
    open: Arc<AtomicUsize>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new cursor; it stays counted until the guard is dropped.
    pub fn acquire(&self) -> CursorGuard {
        self.open.fetch_add(1, Ordering::AcqRel);
        CursorGuard {
            open: Arc::clone(&self.open),
        }
    }

    /// Cursors currently alive.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

/// Keeps a cursor counted as open while alive.
#[derive(Debug)]
pub struct CursorGuard {
    open: Arc<AtomicUsize>,
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}
