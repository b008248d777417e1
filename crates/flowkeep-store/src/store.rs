//! Process-scoped instance store.
//!
//! [`ProcessInstanceStore`] binds one process definition to a storage
//! backend and the state codec.  It is the only place where live instances
//! are turned into bytes and back, and where backend write conditions are
//! chosen.
//!
//! # Writing
//!
//! - `create` is an atomic put-if-absent.
//! - `update` is a compare-and-swap against the version captured by the last
//!   locking read on versioned backends, and last-writer-wins otherwise.
//!
//! Both encode before touching the backend, so an encode failure never
//! reaches storage.  On success the instance is disconnected (see
//! [`ProcessInstance`]).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, instrument, warn};

use crate::backend::{Page, RecordCursor, StorageBackend, StoredRecord};
use crate::codec::StateCodec;
use crate::concurrency::WriteCondition;
use crate::engine::{LiveInstance, ProcessDefinition};
use crate::error::{StoreError, StoreResult};
use crate::instance::ProcessInstance;

/// Entries fetched per round-trip when streaming.
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

/// How `find_by_id` and `stream_all` read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Read without capturing a version; a later `update` is unconditional.
    #[default]
    Plain,
    /// Capture the stored version so a later `update` can detect conflicts.
    Lock,
}

/// CRUD and streaming over the instances of one process definition.
///
/// Cheaply cloneable; clones share the backend and codec.
#[derive(Clone)]
pub struct ProcessInstanceStore {
    definition: Arc<dyn ProcessDefinition>,
    codec: StateCodec,
    backend: Arc<dyn StorageBackend>,
    page_size: usize,
}

impl ProcessInstanceStore {
    pub fn new(
        definition: Arc<dyn ProcessDefinition>,
        codec: StateCodec,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            definition,
            codec,
            backend,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set the number of entries fetched per page when streaming.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn process_id(&self) -> &str {
        self.definition.process_id()
    }

    pub fn definition(&self) -> &Arc<dyn ProcessDefinition> {
        &self.definition
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // ── writes ───────────────────────────────────────────────────────

    /// Store a new instance.  Fails with `DuplicateId` if the id is taken.
    #[instrument(
        skip(self, instance),
        fields(process_id = %self.process_id(), instance_id = %instance.id(), backend = self.backend.name())
    )]
    pub async fn create(&self, instance: &mut ProcessInstance) -> StoreResult<()> {
        self.check_owner(instance)?;
        let bytes = self.encode(instance)?;
        let version = self
            .backend
            .insert_if_absent(self.process_id(), instance.id(), bytes.clone())
            .await?;
        debug!(?version, "instance created");
        instance.disconnect(bytes, version);
        Ok(())
    }

    /// Persist the current state of an instance.
    ///
    /// On versioned backends an instance carrying a version is written only
    /// if the stored version still matches; otherwise `OptimisticLock` is
    /// returned and nothing is written.
    #[instrument(
        skip(self, instance),
        fields(process_id = %self.process_id(), instance_id = %instance.id(), backend = self.backend.name())
    )]
    pub async fn update(&self, instance: &mut ProcessInstance) -> StoreResult<()> {
        self.check_owner(instance)?;
        let bytes = self.encode(instance)?;
        let condition =
            WriteCondition::for_update(self.backend.supports_versioning(), instance.version());
        let version = self
            .backend
            .write(self.process_id(), instance.id(), bytes.clone(), condition)
            .await?;
        debug!(?condition, ?version, "instance updated");
        instance.disconnect(bytes, version);
        Ok(())
    }

    /// Delete an instance.  Returns whether one was stored; removing an
    /// absent id is not an error.
    #[instrument(skip(self), fields(process_id = %self.process_id()))]
    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        let removed = self.backend.delete(self.process_id(), id).await?;
        debug!(removed, "instance removed");
        Ok(removed)
    }

    // ── reads ────────────────────────────────────────────────────────

    /// Load an instance as a live handle, or `None` if absent.
    #[instrument(skip(self), fields(process_id = %self.process_id()))]
    pub async fn find_by_id(&self, id: &str, mode: ReadMode) -> StoreResult<Option<ProcessInstance>> {
        let Some(record) = self.fetch_record(id).await? else {
            debug!("instance not found");
            return Ok(None);
        };
        self.materialize(id, record, mode).map(Some)
    }

    /// Whether an instance is stored, without decoding it.
    pub async fn exists(&self, id: &str) -> StoreResult<bool> {
        self.backend.contains(self.process_id(), id).await
    }

    /// Number of stored instances of this process.
    pub async fn count(&self) -> StoreResult<u64> {
        self.backend.count(self.process_id()).await
    }

    /// Lazily iterate every stored instance, one backend page at a time.
    #[instrument(skip(self), fields(process_id = %self.process_id()))]
    pub async fn stream_all(&self, mode: ReadMode) -> StoreResult<InstanceStream> {
        let cursor = self.backend.scan(self.process_id(), self.page_size).await?;
        Ok(InstanceStream {
            store: self.clone(),
            mode,
            cursor: Some(cursor),
            buffer: VecDeque::new(),
        })
    }

    // ── internals ────────────────────────────────────────────────────

    pub(crate) async fn fetch_record(&self, id: &str) -> StoreResult<Option<StoredRecord>> {
        self.backend.read(self.process_id(), id).await
    }

    pub(crate) fn decode(&self, id: &str, bytes: &[u8]) -> StoreResult<Box<dyn LiveInstance>> {
        self.codec
            .decode(bytes, self.definition.as_ref())
            .map_err(|source| StoreError::CorruptState {
                process_id: self.process_id().to_string(),
                id: id.to_string(),
                source,
            })
    }

    fn materialize(
        &self,
        id: &str,
        record: StoredRecord,
        mode: ReadMode,
    ) -> StoreResult<ProcessInstance> {
        let handle = self.decode(id, &record.payload)?;
        let version = match mode {
            ReadMode::Lock => record.version,
            ReadMode::Plain => None,
        };
        Ok(ProcessInstance::live(handle, version))
    }

    fn encode(&self, instance: &ProcessInstance) -> StoreResult<Vec<u8>> {
        match instance.handle() {
            Some(handle) => self
                .codec
                .encode(self.definition.marshaller(), handle)
                .map_err(|source| StoreError::Marshal {
                    process_id: self.process_id().to_string(),
                    id: instance.id().to_string(),
                    source,
                }),
            None => instance.payload().map(<[u8]>::to_vec).ok_or_else(|| {
                StoreError::InvalidArgument(format!("instance {} has no state", instance.id()))
            }),
        }
    }

    fn check_owner(&self, instance: &ProcessInstance) -> StoreResult<()> {
        if instance.process_id() != self.process_id() {
            return Err(StoreError::InvalidArgument(format!(
                "instance {} belongs to process {}, not {}",
                instance.id(),
                instance.process_id(),
                self.process_id()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessInstanceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInstanceStore")
            .field("process_id", &self.process_id())
            .field("backend", &self.backend.name())
            .field("page_size", &self.page_size)
            .finish()
    }
}

// ── streaming ────────────────────────────────────────────────────────

/// Forward-only iteration over a process's stored instances.
///
/// Holds the backend cursor until exhausted, closed, or dropped.  A record
/// that fails to decode is yielded as `CorruptState` and iteration goes on;
/// a backend failure is yielded once and ends the stream.
pub struct InstanceStream {
    store: ProcessInstanceStore,
    mode: ReadMode,
    cursor: Option<Box<dyn RecordCursor>>,
    buffer: VecDeque<(String, StoredRecord)>,
}

impl InstanceStream {
    /// Next instance, or `None` once the scan is exhausted.
    pub async fn next(&mut self) -> Option<StoreResult<ProcessInstance>> {
        loop {
            if let Some((id, record)) = self.buffer.pop_front() {
                let item = self.store.materialize(&id, record, self.mode);
                if let Err(err) = &item {
                    warn!(instance_id = %id, %err, "skipping unreadable record");
                }
                return Some(item);
            }

            let cursor = self.cursor.as_mut()?;
            match cursor.next_page().await {
                Ok(page) if page.is_empty() => {
                    self.close();
                    return None;
                }
                Ok(page) => self.refill(page),
                Err(err) => {
                    self.close();
                    return Some(Err(err));
                }
            }
        }
    }

    /// Release the backend cursor.  Later calls to `next` return `None`.
    pub fn close(&mut self) {
        if self.cursor.take().is_some() {
            debug!(process_id = %self.store.process_id(), "instance stream closed");
        }
        self.buffer.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.is_none() && self.buffer.is_empty()
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> BoxStream<'static, StoreResult<ProcessInstance>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
        .boxed()
    }

    fn refill(&mut self, page: Page) {
        self.buffer.extend(page);
    }
}

impl fmt::Debug for InstanceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceStream")
            .field("process_id", &self.store.process_id())
            .field("mode", &self.mode)
            .field("buffered", &self.buffer.len())
            .field("closed", &self.cursor.is_none())
            .finish()
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EmbeddedBackend, VersionedCacheBackend};
    use crate::engine::InstanceStatus;
    use crate::test_support::{Counter, CounterProcess, counter_codec, refusing_codec};

    fn store_over(backend: Arc<dyn StorageBackend>) -> ProcessInstanceStore {
        ProcessInstanceStore::new(
            Arc::new(CounterProcess::new("orders")),
            counter_codec(),
            backend,
        )
    }

    fn cache_store() -> ProcessInstanceStore {
        store_over(Arc::new(VersionedCacheBackend::default()))
    }

    fn counter(id: &str) -> ProcessInstance {
        ProcessInstance::new(Box::new(Counter::new("orders", id)))
    }

    fn ticks(instance: &ProcessInstance) -> u32 {
        instance
            .handle()
            .and_then(|h| h.as_any().downcast_ref::<Counter>())
            .map(|c| c.ticks)
            .unwrap()
    }

    #[tokio::test]
    async fn create_disconnects_with_version() {
        let store = cache_store();
        let mut instance = counter("o-1");
        store.create(&mut instance).await.unwrap();

        assert!(!instance.is_live());
        assert!(instance.version().is_some());
        assert!(store.exists("o-1").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn find_plain_drops_version_and_lock_keeps_it() {
        let store = cache_store();
        let mut instance = counter("o-1");
        store.create(&mut instance).await.unwrap();

        let plain = store.find_by_id("o-1", ReadMode::Plain).await.unwrap().unwrap();
        assert_eq!(plain.version(), None);
        assert!(plain.is_live());

        let locked = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        assert_eq!(locked.version(), instance.version());
    }

    #[tokio::test]
    async fn update_makes_changes_visible() {
        let store = cache_store();
        store.create(&mut counter("o-1")).await.unwrap();

        let mut found = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        found
            .handle_mut()
            .unwrap()
            .signal("tick", &serde_json::Value::Null)
            .unwrap();
        store.update(&mut found).await.unwrap();

        let reread = store.find_by_id("o-1", ReadMode::Plain).await.unwrap().unwrap();
        assert_eq!(ticks(&reread), 1);
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let store = cache_store();
        store.create(&mut counter("o-1")).await.unwrap();

        let mut first = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        let mut second = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        let captured = first.version().unwrap();
        assert_eq!(second.version(), Some(captured));

        store.update(&mut first).await.unwrap();
        let bumped = first.version().unwrap();
        assert!(bumped > captured);

        let err = store.update(&mut second).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::OptimisticLock { expected, actual, .. }
                if expected == captured && actual == Some(bumped)
        ));
        assert!(err.is_retryable());
        assert!(second.is_live(), "rejected instance stays live");

        let stored = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        assert_eq!(stored.version(), Some(bumped));
    }

    #[tokio::test]
    async fn failed_encode_never_reaches_the_backend() {
        let backend: Arc<dyn StorageBackend> = Arc::new(VersionedCacheBackend::default());
        let refusing = ProcessInstanceStore::new(
            Arc::new(CounterProcess::new("orders")),
            refusing_codec(),
            Arc::clone(&backend),
        );

        let err = refusing.create(&mut counter("o-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Marshal { ref id, .. } if id == "o-1"));
        assert_eq!(refusing.count().await.unwrap(), 0);
        assert!(!refusing.exists("o-1").await.unwrap());

        store_over(Arc::clone(&backend))
            .create(&mut counter("o-1"))
            .await
            .unwrap();
        let before = backend.read("orders", "o-1").await.unwrap().unwrap();

        let mut found = refusing.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        found
            .handle_mut()
            .unwrap()
            .signal("tick", &serde_json::Value::Null)
            .unwrap();
        let err = refusing.update(&mut found).await.unwrap_err();
        assert!(matches!(err, StoreError::Marshal { .. }));
        assert!(found.is_live());

        let after = backend.read("orders", "o-1").await.unwrap().unwrap();
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.version, before.version);
    }

    #[tokio::test]
    async fn update_of_disconnected_instance_reuses_bytes() {
        let store = cache_store();
        let mut instance = counter("o-1");
        store.create(&mut instance).await.unwrap();
        let before = instance.version();

        store.update(&mut instance).await.unwrap();
        assert!(instance.version() > before);
    }

    #[tokio::test]
    async fn foreign_instance_is_rejected() {
        let store = cache_store();
        let mut foreign = ProcessInstance::new(Box::new(Counter::new("invoices", "i-1")));
        let err = store.create(&mut foreign).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = cache_store();
        store.create(&mut counter("o-1")).await.unwrap();

        assert!(store.remove("o-1").await.unwrap());
        assert!(!store.remove("o-1").await.unwrap());
        assert!(store.find_by_id("o-1", ReadMode::Plain).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reload_and_connect_round_trip() {
        let store = cache_store();
        let mut instance = counter("o-1");
        store.create(&mut instance).await.unwrap();

        let mut other = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        other
            .handle_mut()
            .unwrap()
            .signal("tick", &serde_json::Value::Null)
            .unwrap();
        store.update(&mut other).await.unwrap();

        assert!(instance.reload(&store).await.unwrap());
        assert_eq!(instance.version(), other.version());

        let handle = instance.connect(&store).unwrap();
        assert_eq!(handle.status(), InstanceStatus::Active);
        assert_eq!(ticks(&instance), 1);
    }

    #[tokio::test]
    async fn reload_of_removed_instance_reports_vanished() {
        let store = cache_store();
        let mut instance = counter("o-1");
        store.create(&mut instance).await.unwrap();
        store.remove("o-1").await.unwrap();

        assert!(!instance.reload(&store).await.unwrap());
        assert!(instance.connect(&store).is_err());
    }

    #[tokio::test]
    async fn stream_yields_every_instance() {
        let store = cache_store().with_page_size(3);
        for i in 0..7 {
            store.create(&mut counter(&format!("o-{i}"))).await.unwrap();
        }

        let mut stream = store.stream_all(ReadMode::Plain).await.unwrap();
        let mut ids = Vec::new();
        while let Some(item) = stream.next().await {
            ids.push(item.unwrap().id().to_string());
        }
        ids.sort();
        assert_eq!(ids.len(), 7);
        assert!(stream.is_closed());
        assert_eq!(store.backend().open_cursors(), 0);
    }

    #[tokio::test]
    async fn embedded_store_has_no_versions() {
        let backend = EmbeddedBackend::open_in_memory().await.unwrap();
        let store = store_over(Arc::new(backend));
        let mut instance = counter("o-1");
        store.create(&mut instance).await.unwrap();
        assert_eq!(instance.version(), None);

        let mut a = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        let mut b = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        store.update(&mut a).await.unwrap();
        store.update(&mut b).await.unwrap();
    }
}
