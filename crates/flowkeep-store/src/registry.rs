//! Process registration.
//!
//! A [`StoreRegistry`] owns one backend and one [`StateCodec`] and hands
//! out a [`ProcessInstanceStore`] per registered process definition.
//! Registering a process registers its marshaller at the same time, so the
//! codec can decode every instance the registry's stores will ever see.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::backend::StorageBackend;
use crate::codec::{InstanceMarshaller, StateCodec};
use crate::config::StoreConfig;
use crate::engine::ProcessDefinition;
use crate::error::{StoreError, StoreResult};
use crate::store::{DEFAULT_PAGE_SIZE, ProcessInstanceStore};

/// Process definitions sharing one backend.
///
/// Cheaply cloneable; clones share the same registrations.
#[derive(Clone)]
pub struct StoreRegistry {
    backend: Arc<dyn StorageBackend>,
    codec: StateCodec,
    definitions: Arc<DashMap<String, Arc<dyn ProcessDefinition>>>,
    page_size: usize,
}

impl StoreRegistry {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            codec: StateCodec::new(),
            definitions: Arc::new(DashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Build the configured backend and an empty registry over it.
    pub async fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        let backend = config.open_backend().await?;
        Ok(Self::new(backend).with_page_size(config.page_size))
    }

    /// Page size handed to every store created by this registry.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Register a process definition together with the marshaller for its
    /// instances.
    ///
    /// The marshaller's name must match the one the definition declares.
    /// Re-registering a process id replaces the previous definition.
    pub fn register(
        &self,
        definition: Arc<dyn ProcessDefinition>,
        marshaller: Arc<dyn InstanceMarshaller>,
    ) -> StoreResult<()> {
        if marshaller.name() != definition.marshaller() {
            return Err(StoreError::InvalidArgument(format!(
                "process {} expects marshaller `{}`, got `{}`",
                definition.process_id(),
                definition.marshaller(),
                marshaller.name()
            )));
        }
        self.codec.register(marshaller);
        self.register_definition(definition)
    }

    /// Register a process definition whose marshaller is already known.
    pub fn register_definition(&self, definition: Arc<dyn ProcessDefinition>) -> StoreResult<()> {
        if !self.codec.is_registered(definition.marshaller()) {
            return Err(StoreError::InvalidArgument(format!(
                "marshaller `{}` for process {} is not registered",
                definition.marshaller(),
                definition.process_id()
            )));
        }
        let process_id = definition.process_id().to_string();
        info!(
            process_id = %process_id,
            marshaller = definition.marshaller(),
            backend = self.backend.name(),
            "process registered"
        );
        self.definitions.insert(process_id, definition);
        Ok(())
    }

    /// The store for `process_id`, or `UnknownProcess`.
    pub fn store(&self, process_id: &str) -> StoreResult<ProcessInstanceStore> {
        let definition = self
            .definitions
            .get(process_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::UnknownProcess(process_id.to_string()))?;
        Ok(
            ProcessInstanceStore::new(definition, self.codec.clone(), Arc::clone(&self.backend))
                .with_page_size(self.page_size),
        )
    }

    pub fn contains(&self, process_id: &str) -> bool {
        self.definitions.contains_key(process_id)
    }

    /// Registered process ids, sorted.
    pub fn process_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn codec(&self) -> &StateCodec {
        &self.codec
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("backend", &self.backend.name())
            .field("processes", &self.process_ids())
            .finish()
    }
}
