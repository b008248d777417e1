//! Integration tests for the flowkeep-store crate.
//!
//! These tests drive the public store API end to end against both backend
//! strategies, including a real SQLite database on disk (via tempfile).

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;

use flowkeep_store::{
    BackendConfig, BoxError, EmbeddedBackend, InstanceStatus, LiveInstance, ProcessDefinition,
    ProcessInstance, ProcessInstanceStore, ReadMode, RecordCursor, SerdeMarshaller,
    StorageBackend, StoreConfig, StoreError, StoreRegistry, StoreResult, StoredRecord,
    VersionedCacheBackend, WriteCondition,
};

// ═══════════════════════════════════════════════════════════════════════
//  Test engine
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: String,
    process_id: String,
    items: Vec<String>,
    status: InstanceStatus,
}

impl LiveInstance for Order {
    fn id(&self) -> &str {
        &self.id
    }

    fn process_id(&self) -> &str {
        &self.process_id
    }

    fn status(&self) -> InstanceStatus {
        self.status
    }

    fn signal(&mut self, signal: &str, payload: &serde_json::Value) -> Result<(), BoxError> {
        match signal {
            "add" => self.items.push(payload.as_str().unwrap_or_default().to_string()),
            "ship" => self.status = InstanceStatus::Completed,
            other => return Err(format!("unknown signal {other}").into()),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct OrderProcess;

impl ProcessDefinition for OrderProcess {
    fn process_id(&self) -> &str {
        "orders"
    }

    fn marshaller(&self) -> &str {
        "order"
    }

    fn start_instance(
        &self,
        instance_id: &str,
        _trigger: &serde_json::Value,
    ) -> Result<Box<dyn LiveInstance>, BoxError> {
        Ok(Box::new(Order {
            id: instance_id.to_string(),
            process_id: "orders".to_string(),
            items: Vec::new(),
            status: InstanceStatus::Active,
        }))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}

fn new_order(id: &str) -> ProcessInstance {
    let handle = OrderProcess
        .start_instance(id, &serde_json::Value::Null)
        .unwrap();
    ProcessInstance::new(handle)
}

fn items(instance: &ProcessInstance) -> Vec<String> {
    instance
        .handle()
        .and_then(|h| h.as_any().downcast_ref::<Order>())
        .map(|o| o.items.clone())
        .unwrap()
}

fn store_over(backend: Arc<dyn StorageBackend>) -> ProcessInstanceStore {
    let registry = StoreRegistry::new(backend).with_page_size(4);
    registry
        .register(
            Arc::new(OrderProcess),
            Arc::new(SerdeMarshaller::<Order>::new("order")),
        )
        .unwrap();
    registry.store("orders").unwrap()
}

async fn backends() -> Vec<Arc<dyn StorageBackend>> {
    vec![
        Arc::new(VersionedCacheBackend::default()),
        Arc::new(EmbeddedBackend::open_in_memory().await.unwrap()),
    ]
}

/// Delegates to another backend and counts reads.
struct CountingBackend {
    inner: Arc<dyn StorageBackend>,
    reads: AtomicUsize,
}

#[async_trait]
impl StorageBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn supports_versioning(&self) -> bool {
        self.inner.supports_versioning()
    }

    async fn insert_if_absent(
        &self,
        namespace: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> StoreResult<Option<u64>> {
        self.inner.insert_if_absent(namespace, key, payload).await
    }

    async fn write(
        &self,
        namespace: &str,
        key: &str,
        payload: Vec<u8>,
        condition: WriteCondition,
    ) -> StoreResult<Option<u64>> {
        self.inner.write(namespace, key, payload, condition).await
    }

    async fn read(&self, namespace: &str, key: &str) -> StoreResult<Option<StoredRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(namespace, key).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        self.inner.delete(namespace, key).await
    }

    async fn contains(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        self.inner.contains(namespace, key).await
    }

    async fn count(&self, namespace: &str) -> StoreResult<u64> {
        self.inner.count(namespace).await
    }

    async fn scan(&self, namespace: &str, page_size: usize) -> StoreResult<Box<dyn RecordCursor>> {
        self.inner.scan(namespace, page_size).await
    }

    fn open_cursors(&self) -> usize {
        self.inner.open_cursors()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  CRUD properties, both backends
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn create_is_unique() {
    init_tracing();
    for backend in backends().await {
        let store = store_over(backend);
        store.create(&mut new_order("o-1")).await.unwrap();

        let err = store.create(&mut new_order("o-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { ref id, .. } if id == "o-1"));
        assert!(!err.is_retryable());
        assert_eq!(store.count().await.unwrap(), 1);
    }
}

#[tokio::test]
async fn updates_are_visible_to_later_reads() {
    for backend in backends().await {
        let store = store_over(backend);
        store.create(&mut new_order("o-1")).await.unwrap();

        let mut order = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
        order
            .handle_mut()
            .unwrap()
            .signal("add", &serde_json::json!("book"))
            .unwrap();
        store.update(&mut order).await.unwrap();

        let reread = store.find_by_id("o-1", ReadMode::Plain).await.unwrap().unwrap();
        assert_eq!(items(&reread), vec!["book"]);
    }
}

#[tokio::test]
async fn removed_instances_are_not_found() {
    for backend in backends().await {
        let store = store_over(backend);
        store.create(&mut new_order("o-1")).await.unwrap();

        assert!(store.remove("o-1").await.unwrap());
        assert!(!store.remove("o-1").await.unwrap());
        assert!(!store.exists("o-1").await.unwrap());
        assert!(store.find_by_id("o-1", ReadMode::Lock).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn stream_visits_every_instance_and_releases_cursor() {
    for backend in backends().await {
        let store = store_over(Arc::clone(&backend));
        for i in 0..10 {
            store.create(&mut new_order(&format!("o-{i:02}"))).await.unwrap();
        }

        let mut ids: Vec<String> = store
            .stream_all(ReadMode::Plain)
            .await
            .unwrap()
            .into_stream()
            .map(|item| item.unwrap().id().to_string())
            .collect()
            .await;
        ids.sort();
        let expected: Vec<String> = (0..10).map(|i| format!("o-{i:02}")).collect();
        assert_eq!(ids, expected);
        assert_eq!(backend.open_cursors(), 0, "{} leaked a cursor", backend.name());
    }
}

#[tokio::test]
async fn early_close_releases_cursor() {
    for backend in backends().await {
        let store = store_over(Arc::clone(&backend));
        for i in 0..10 {
            store.create(&mut new_order(&format!("o-{i}"))).await.unwrap();
        }

        let mut stream = store.stream_all(ReadMode::Lock).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.is_live());
        assert_eq!(backend.open_cursors(), 1);

        stream.close();
        assert_eq!(backend.open_cursors(), 0);
        assert!(stream.next().await.is_none());

        let dropped = store.stream_all(ReadMode::Plain).await.unwrap();
        assert_eq!(backend.open_cursors(), 1);
        drop(dropped);
        assert_eq!(backend.open_cursors(), 0);
    }
}

#[tokio::test]
async fn corrupt_records_do_not_end_the_stream() {
    for backend in backends().await {
        let store = store_over(Arc::clone(&backend));
        store.create(&mut new_order("a")).await.unwrap();
        backend
            .insert_if_absent("orders", "b", vec![1, 0, 3, b'z', b'z', b'z', 0xff])
            .await
            .unwrap();
        store.create(&mut new_order("c")).await.unwrap();

        let err = store.find_by_id("b", ReadMode::Plain).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptState { ref id, .. } if id == "b"));

        let mut stream = store.stream_all(ReadMode::Plain).await.unwrap();
        let mut ok = 0;
        let mut corrupt = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(_) => ok += 1,
                Err(StoreError::CorruptState { .. }) => corrupt += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((ok, corrupt), (2, 1));
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_create_has_one_winner() {
    for backend in backends().await {
        let store = store_over(backend);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.create(&mut new_order("race")).await
            }));
        }

        let mut winners = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => winners += 1,
                Err(StoreError::DuplicateId { .. }) => duplicates += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(duplicates, 7);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_updates_on_one_version_have_one_winner() {
    let store = store_over(Arc::new(VersionedCacheBackend::default()));
    store.create(&mut new_order("o-1")).await.unwrap();

    let barrier = Arc::new(Barrier::new(6));
    let mut tasks = Vec::new();
    for n in 0..6 {
        let store = store.clone();
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            let mut order = store.find_by_id("o-1", ReadMode::Lock).await?.unwrap();
            let captured = order.version();
            order
                .handle_mut()
                .unwrap()
                .signal("add", &serde_json::json!(format!("item-{n}")))
                .unwrap();
            barrier.wait().await;
            store
                .update(&mut order)
                .await
                .map(|()| (captured, order.version()))
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(versions) => winners.push(versions),
            Err(err) => assert!(matches!(err, StoreError::OptimisticLock { .. })),
        }
    }
    assert_eq!(winners.len(), 1);
    let (captured, written) = winners[0];
    assert!(written.unwrap() > captured.unwrap(), "winning write bumps the version");

    let stored = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
    assert_eq!(stored.version(), written);
    assert_eq!(items(&stored).len(), 1, "no lost or merged updates");
}

// ═══════════════════════════════════════════════════════════════════════
//  Lazy reload
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reload_reads_the_backend_once() {
    let counting = Arc::new(CountingBackend {
        inner: Arc::new(VersionedCacheBackend::default()),
        reads: AtomicUsize::new(0),
    });
    let store = store_over(counting.clone());

    let mut order = new_order("o-1");
    store.create(&mut order).await.unwrap();
    assert_eq!(counting.reads.load(Ordering::SeqCst), 0, "create does not refetch");

    assert!(order.reload(&store).await.unwrap());
    assert!(order.reload(&store).await.unwrap());
    assert_eq!(counting.reads.load(Ordering::SeqCst), 1);

    let handle = order.connect(&store).unwrap();
    assert_eq!(handle.id(), "o-1");
    assert_eq!(counting.reads.load(Ordering::SeqCst), 1, "connect decodes cached bytes");
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration and on-disk lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn embedded_store_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new()
        .with_page_size(2)
        .with_backend(BackendConfig::embedded(dir.path().join("instances.db")));

    {
        let registry = StoreRegistry::from_config(&config).await.unwrap();
        registry
            .register(
                Arc::new(OrderProcess),
                Arc::new(SerdeMarshaller::<Order>::new("order")),
            )
            .unwrap();
        let store = registry.store("orders").unwrap();
        let mut order = new_order("o-1");
        order
            .handle_mut()
            .unwrap()
            .signal("add", &serde_json::json!("lamp"))
            .unwrap();
        store.create(&mut order).await.unwrap();
    }

    let registry = StoreRegistry::from_config(&config).await.unwrap();
    registry
        .register(
            Arc::new(OrderProcess),
            Arc::new(SerdeMarshaller::<Order>::new("order")),
        )
        .unwrap();
    let store = registry.store("orders").unwrap();
    let order = store.find_by_id("o-1", ReadMode::Lock).await.unwrap().unwrap();
    assert_eq!(items(&order), vec!["lamp"]);
    assert_eq!(order.version(), None);
}

#[tokio::test]
async fn unregistered_process_has_no_store() {
    let registry = StoreRegistry::from_config(&StoreConfig::default()).await.unwrap();
    assert!(matches!(
        registry.store("orders").unwrap_err(),
        StoreError::UnknownProcess(_)
    ));
}
