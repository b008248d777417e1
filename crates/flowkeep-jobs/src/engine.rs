//! Engine callback contract.
//!
//! A firing re-enters the process engine through exactly one
//! [`ProcessEngine`] call: start a new instance, or signal an existing one.
//! [`StoreBackedEngine`] implements the contract over a
//! [`StoreRegistry`], resolving instances through their store and writing
//! them back after the signal.

use async_trait::async_trait;
use flowkeep_store::{BoxError, ProcessInstance, ReadMode, StoreError, StoreRegistry};
use tracing::{debug, info};
use uuid::Uuid;

/// Why an engine callback failed.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The target instance no longer exists.
    #[error("process instance not found: {process_id}/{instance_id}")]
    NotFound {
        process_id: String,
        instance_id: String,
    },

    /// No process definition is registered under this id.
    #[error("unknown process: {0}")]
    UnknownProcess(String),

    /// The store refused the read or write.
    #[error(transparent)]
    Store(StoreError),

    /// The engine itself failed to start or signal the instance.
    #[error("engine call failed: {0}")]
    Failed(#[source] BoxError),
}

impl EngineError {
    /// Whether the firing's target has disappeared, which cancels the job.
    pub fn is_target_gone(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::UnknownProcess(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownProcess(process_id) => Self::UnknownProcess(process_id),
            other => Self::Store(other),
        }
    }
}

/// The engine as seen by the scheduler.
#[async_trait]
pub trait ProcessEngine: Send + Sync {
    /// Create and start an instance of `process_id`; returns its id.
    async fn start_process(
        &self,
        process_id: &str,
        trigger: &serde_json::Value,
    ) -> Result<String, EngineError>;

    /// Deliver `signal` to an existing instance.
    async fn signal_instance(
        &self,
        process_id: &str,
        instance_id: &str,
        signal: &str,
        payload: &serde_json::Value,
    ) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// Store-backed engine
// ---------------------------------------------------------------------------

/// Engine adapter that runs instances straight out of their stores.
///
/// Signalling reads the instance with a lock, signals the live handle and
/// writes it back with a version check.  Instances that reach a terminal
/// status are removed instead of written.
#[derive(Debug, Clone)]
pub struct StoreBackedEngine {
    registry: StoreRegistry,
}

impl StoreBackedEngine {
    pub fn new(registry: StoreRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }
}

#[async_trait]
impl ProcessEngine for StoreBackedEngine {
    async fn start_process(
        &self,
        process_id: &str,
        trigger: &serde_json::Value,
    ) -> Result<String, EngineError> {
        let store = self.registry.store(process_id)?;
        let instance_id = Uuid::now_v7().to_string();
        let handle = store
            .definition()
            .start_instance(&instance_id, trigger)
            .map_err(EngineError::Failed)?;

        let mut instance = ProcessInstance::new(handle);
        store.create(&mut instance).await?;
        info!(process_id, instance_id = %instance_id, "process instance started");
        Ok(instance_id)
    }

    async fn signal_instance(
        &self,
        process_id: &str,
        instance_id: &str,
        signal: &str,
        payload: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let store = self.registry.store(process_id)?;
        let mut instance = store
            .find_by_id(instance_id, ReadMode::Lock)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                process_id: process_id.to_string(),
                instance_id: instance_id.to_string(),
            })?;

        let handle = instance.connect(&store)?;
        handle.signal(signal, payload).map_err(EngineError::Failed)?;
        let status = handle.status();

        if status.is_terminal() {
            store.remove(instance_id).await?;
            info!(process_id, instance_id, %status, "process instance finished");
        } else {
            store.update(&mut instance).await?;
            debug!(process_id, instance_id, signal, %status, "process instance signalled");
        }
        Ok(())
    }
}
