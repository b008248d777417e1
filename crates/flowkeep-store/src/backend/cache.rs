//! Versioned cache backend using [`moka`].
//!
//! Mirrors the primitives a remote versioned cache exposes to its clients:
//! every entry carries a server-assigned version stamp, `create` is an
//! atomic put-if-absent, and `update` is a replace-with-version.  Both run
//! as per-key compute operations, so concurrent writers on one key are
//! serialized by the cache itself and exactly one of them wins per version.
//!
//! Each process namespace gets its own named cache plus an ordered key
//! index, so scans page through keys without loading the whole key space.
//! Entries never expire and are never evicted.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use tracing::debug;

use super::{CursorGuard, CursorTracker, Page, RecordCursor, StorageBackend, StoredRecord};
use crate::concurrency::{VersionClock, WriteCondition};
use crate::error::{StoreError, StoreResult};

/// A stored entry with its metadata.
#[derive(Debug, Clone)]
struct VersionedEntry {
    payload: Arc<[u8]>,
    version: u64,
}

impl VersionedEntry {
    fn to_record(&self) -> StoredRecord {
        StoredRecord {
            payload: self.payload.to_vec(),
            version: Some(self.version),
        }
    }
}

/// One process namespace: the entries and an ordered index of their keys.
///
/// The index is only changed inside a per-key compute operation, so it
/// agrees with the cache for every key once that operation completes.
#[derive(Clone)]
struct Namespace {
    entries: Cache<String, VersionedEntry>,
    keys: Arc<RwLock<BTreeSet<String>>>,
}

impl Namespace {
    fn new(name: &str, initial_capacity: usize) -> Self {
        Self {
            entries: Cache::builder()
                .name(name)
                .initial_capacity(initial_capacity)
                .build(),
            keys: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    fn index(&self, key: &str) {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if !keys.contains(key) {
            keys.insert(key.to_string());
        }
    }

    fn unindex(&self, key: &str) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Up to `limit` keys strictly after `after`, in order.
    fn keys_after(&self, after: Option<&str>, limit: usize) -> Vec<String> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let lower = match after {
            Some(last) => Bound::Excluded(last),
            None => Bound::Unbounded,
        };
        keys.range::<str, _>((lower, Bound::Unbounded))
            .take(limit)
            .cloned()
            .collect()
    }
}

// ── stats ────────────────────────────────────────────────────────────

/// Counters tracking backend traffic.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    conflicts: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads that found an entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Reads that found nothing.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Writes rejected by put-if-absent or replace-with-version.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} conflicts={}",
            self.hits(),
            self.misses(),
            self.conflicts(),
        )
    }
}

// ── backend ──────────────────────────────────────────────────────────

/// Versioned cache strategy.
///
/// Cheaply cloneable; clones share the same caches and version clock.
#[derive(Clone)]
pub struct VersionedCacheBackend {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    namespaces: DashMap<String, Namespace>,
    clock: VersionClock,
    stats: CacheStats,
    cursors: CursorTracker,
    initial_capacity: usize,
}

impl VersionedCacheBackend {
    /// Start building a new backend.
    pub fn builder() -> VersionedCacheBackendBuilder {
        VersionedCacheBackendBuilder {
            initial_capacity: 1_024,
        }
    }

    /// Traffic counters.
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Last version stamp handed out.
    pub fn current_version(&self) -> u64 {
        self.inner.clock.current()
    }

    fn existing(&self, namespace: &str) -> Option<Namespace> {
        self.inner
            .namespaces
            .get(namespace)
            .map(|ns| ns.value().clone())
    }

    fn namespace(&self, namespace: &str) -> Namespace {
        if let Some(ns) = self.existing(namespace) {
            return ns;
        }
        self.inner
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| {
                debug!(namespace, "creating cache namespace");
                Namespace::new(namespace, self.inner.initial_capacity)
            })
            .value()
            .clone()
    }
}

impl Default for VersionedCacheBackend {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[async_trait]
impl StorageBackend for VersionedCacheBackend {
    fn name(&self) -> &'static str {
        "versioned-cache"
    }

    fn supports_versioning(&self) -> bool {
        true
    }

    async fn insert_if_absent(
        &self,
        namespace: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> StoreResult<Option<u64>> {
        let ns = self.namespace(namespace);
        let clock = &self.inner.clock;
        let payload: Arc<[u8]> = payload.into();

        let result = ns
            .entries
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current {
                    Some(_) => Op::Nop,
                    None => {
                        ns.index(key);
                        Op::Put(VersionedEntry {
                            payload,
                            version: clock.next(),
                        })
                    }
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::Inserted(entry) => {
                let version = entry.value().version;
                debug!(namespace, key, version, "entry inserted");
                Ok(Some(version))
            }
            _ => {
                self.inner.stats.record_conflict();
                Err(StoreError::DuplicateId {
                    process_id: namespace.to_string(),
                    id: key.to_string(),
                })
            }
        }
    }

    async fn write(
        &self,
        namespace: &str,
        key: &str,
        payload: Vec<u8>,
        condition: WriteCondition,
    ) -> StoreResult<Option<u64>> {
        let ns = self.namespace(namespace);
        let clock = &self.inner.clock;
        let payload: Arc<[u8]> = payload.into();

        let result = ns
            .entries
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let current_version = current.as_ref().map(|e| e.value().version);
                let op = if condition.admits(current_version) {
                    ns.index(key);
                    Op::Put(VersionedEntry {
                        payload,
                        version: clock.next(),
                    })
                } else {
                    Op::Nop
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => {
                let version = entry.value().version;
                debug!(namespace, key, version, "entry written");
                Ok(Some(version))
            }
            CompResult::Unchanged(entry) => {
                self.inner.stats.record_conflict();
                Err(conflict(namespace, key, condition, Some(entry.value().version)))
            }
            CompResult::StillNone(_) | CompResult::Removed(_) => {
                self.inner.stats.record_conflict();
                Err(conflict(namespace, key, condition, None))
            }
        }
    }

    async fn read(&self, namespace: &str, key: &str) -> StoreResult<Option<StoredRecord>> {
        let entry = match self.existing(namespace) {
            Some(ns) => ns.entries.get(key).await,
            None => None,
        };
        match entry {
            Some(entry) => {
                self.inner.stats.record_hit();
                Ok(Some(entry.to_record()))
            }
            None => {
                self.inner.stats.record_miss();
                Ok(None)
            }
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        let Some(ns) = self.existing(namespace) else {
            return Ok(false);
        };
        let result = ns
            .entries
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current {
                    Some(_) => {
                        ns.unindex(key);
                        Op::Remove
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        Ok(matches!(result, CompResult::Removed(_)))
    }

    async fn contains(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        Ok(self
            .existing(namespace)
            .is_some_and(|ns| ns.entries.contains_key(key)))
    }

    async fn count(&self, namespace: &str) -> StoreResult<u64> {
        Ok(self
            .existing(namespace)
            .map(|ns| ns.len() as u64)
            .unwrap_or(0))
    }

    async fn scan(&self, namespace: &str, page_size: usize) -> StoreResult<Box<dyn RecordCursor>> {
        if page_size == 0 {
            return Err(StoreError::InvalidArgument("page size must be positive".into()));
        }
        let ns = self.existing(namespace);
        debug!(namespace, page_size, "cache scan opened");
        Ok(Box::new(CacheCursor {
            ns,
            last_key: None,
            exhausted: false,
            page_size,
            _guard: self.inner.cursors.acquire(),
        }))
    }

    fn open_cursors(&self) -> usize {
        self.inner.cursors.open()
    }
}

fn conflict(
    namespace: &str,
    key: &str,
    condition: WriteCondition,
    actual: Option<u64>,
) -> StoreError {
    let expected = match condition {
        WriteCondition::ExpectVersion(v) => v,
        WriteCondition::Unconditional => 0,
    };
    debug!(namespace, key, expected, ?actual, "replace-with-version rejected");
    StoreError::OptimisticLock {
        process_id: namespace.to_string(),
        id: key.to_string(),
        expected,
        actual,
    }
}

// ── cursor ───────────────────────────────────────────────────────────

/// Pages through the key index in key order, resuming after the last key
/// it returned.
///
/// Keys removed before the cursor reaches them are skipped; keys added
/// behind its position are not visited.
struct CacheCursor {
    ns: Option<Namespace>,
    last_key: Option<String>,
    exhausted: bool,
    page_size: usize,
    _guard: CursorGuard,
}

#[async_trait]
impl RecordCursor for CacheCursor {
    async fn next_page(&mut self) -> StoreResult<Page> {
        let Some(ns) = &self.ns else {
            return Ok(Vec::new());
        };

        let mut page = Vec::with_capacity(self.page_size);
        while page.len() < self.page_size && !self.exhausted {
            let want = self.page_size - page.len();
            let keys = ns.keys_after(self.last_key.as_deref(), want);
            if keys.len() < want {
                self.exhausted = true;
            }
            for key in keys {
                if let Some(entry) = ns.entries.get(&key).await {
                    page.push((key.clone(), entry.to_record()));
                }
                self.last_key = Some(key);
            }
        }
        Ok(page)
    }
}

// ── builder ──────────────────────────────────────────────────────────

/// Builder for [`VersionedCacheBackend`].
pub struct VersionedCacheBackendBuilder {
    initial_capacity: usize,
}

impl VersionedCacheBackendBuilder {
    /// Capacity pre-allocated for each namespace.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Build the backend.
    pub fn build(self) -> VersionedCacheBackend {
        debug!(initial_capacity = self.initial_capacity, "versioned cache backend created");
        VersionedCacheBackend {
            inner: Arc::new(CacheInner {
                namespaces: DashMap::new(),
                clock: VersionClock::new(),
                stats: CacheStats::default(),
                cursors: CursorTracker::new(),
                initial_capacity: self.initial_capacity,
            }),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
