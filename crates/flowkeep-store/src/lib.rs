//! # flowkeep-store
//!
//! Durable storage for long-running process instances.
//!
//! Live engine instances are framed by the [`StateCodec`] and written through
//! a pluggable [`StorageBackend`].  Writers on the same instance are kept
//! honest by optimistic locking wherever the backend stamps versions, and
//! written instances are disconnected from the engine and reloaded lazily.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  StoreRegistry  (process id -> definition)  │
//! ├─────────────────────────────────────────────┤
//! │  ProcessInstanceStore                       │
//! │    create / update / find / remove / stream │
//! │    ProcessInstance  Live <-> Disconnected   │
//! ├──────────────────────┬──────────────────────┤
//! │  StateCodec          │  WriteCondition      │
//! │  (discriminator +    │  (CAS on version     │
//! │   marshaller bytes)  │   stamps)            │
//! ├──────────────────────┴──────────────────────┤
//! │  VersionedCacheBackend  │  EmbeddedBackend  │
//! │  (moka, version clock)  │  (rusqlite WAL)   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use flowkeep_store::{ReadMode, StoreConfig, StoreRegistry, SerdeMarshaller};
//!
//! let registry = StoreRegistry::from_config(&StoreConfig::default()).await?;
//! registry.register(Arc::new(OrderProcess), Arc::new(SerdeMarshaller::<Order>::new("order")))?;
//!
//! let store = registry.store("orders")?;
//! let mut found = store.find_by_id("o-1", ReadMode::Lock).await?;
//! ```

pub mod backend;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod instance;
pub mod migration;
pub mod registry;
pub mod store;

#[cfg(test)]
mod test_support;

// ── re-exports ───────────────────────────────────────────────────────

pub use backend::{
    EmbeddedBackend, RecordCursor, StorageBackend, StoredRecord, VersionedCacheBackend,
};
pub use codec::{CodecError, InstanceMarshaller, SerdeMarshaller, StateCodec};
pub use concurrency::WriteCondition;
pub use config::{BackendConfig, StoreConfig};
pub use db::{Database, Pragmas};
pub use engine::{BoxError, InstanceStatus, LiveInstance, ProcessDefinition};
pub use error::{StoreError, StoreResult};
pub use instance::{ProcessInstance, ReloadState};
pub use registry::StoreRegistry;
pub use store::{InstanceStream, ProcessInstanceStore, ReadMode};
