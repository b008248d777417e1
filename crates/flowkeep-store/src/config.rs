//! Store configuration.
//!
//! [`StoreConfig`] selects the storage backend and the streaming page size.
//! Sensible defaults are provided via [`Default`], a builder-style API lets
//! callers customise fields fluently, and both structs deserialize with
//! `serde` so hosts can embed them in their own configuration files.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{EmbeddedBackend, StorageBackend, VersionedCacheBackend};
use crate::db::Pragmas;
use crate::error::{StoreError, StoreResult};
use crate::store::DEFAULT_PAGE_SIZE;

/// Which backend to store instances in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process versioned cache with optimistic locking.
    VersionedCache {
        /// Entries pre-allocated per process namespace.
        ///
        /// Default: **1 024**.
        #[serde(default = "default_initial_capacity")]
        initial_capacity: usize,
    },
    /// SQLite file, or an in-memory database when `path` is unset.
    Embedded {
        #[serde(default)]
        path: Option<PathBuf>,
        /// Default: **5 000 ms**.
        #[serde(default = "default_busy_timeout_ms")]
        busy_timeout_ms: u32,
        /// Default: **256 MiB**.
        #[serde(default = "default_mmap_size")]
        mmap_size: i64,
    },
}

fn default_initial_capacity() -> usize {
    1_024
}

fn default_busy_timeout_ms() -> u32 {
    Pragmas::default().busy_timeout_ms
}

fn default_mmap_size() -> i64 {
    Pragmas::default().mmap_size
}

impl BackendConfig {
    /// Versioned cache with default capacity.
    pub fn versioned_cache() -> Self {
        Self::VersionedCache {
            initial_capacity: default_initial_capacity(),
        }
    }

    /// SQLite database at `path` with default pragmas.
    pub fn embedded(path: impl Into<PathBuf>) -> Self {
        Self::Embedded {
            path: Some(path.into()),
            busy_timeout_ms: default_busy_timeout_ms(),
            mmap_size: default_mmap_size(),
        }
    }

    /// In-memory SQLite database.
    pub fn embedded_in_memory() -> Self {
        Self::Embedded {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            mmap_size: default_mmap_size(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::versioned_cache()
    }
}

/// Backend selection plus streaming behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Entries fetched per backend round-trip when streaming.
    ///
    /// Default: **1 000**.
    pub page_size: usize,

    /// Default: versioned cache.
    pub backend: BackendConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            backend: BackendConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the streaming page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Select the backend.
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Reject values no backend can work with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.page_size == 0 {
            return Err(StoreError::InvalidArgument("page_size must be positive".into()));
        }
        if let BackendConfig::Embedded { mmap_size, .. } = &self.backend
            && *mmap_size < 0
        {
            return Err(StoreError::InvalidArgument("mmap_size must not be negative".into()));
        }
        Ok(())
    }

    /// Build the configured backend, migrating it if it is a database.
    pub async fn open_backend(&self) -> StoreResult<Arc<dyn StorageBackend>> {
        self.validate()?;
        match &self.backend {
            BackendConfig::VersionedCache { initial_capacity } => {
                info!(initial_capacity, "using versioned cache backend");
                Ok(Arc::new(
                    VersionedCacheBackend::builder()
                        .initial_capacity(*initial_capacity)
                        .build(),
                ))
            }
            BackendConfig::Embedded {
                path,
                busy_timeout_ms,
                mmap_size,
            } => {
                let pragmas = Pragmas {
                    busy_timeout_ms: *busy_timeout_ms,
                    mmap_size: *mmap_size,
                };
                let backend = match path {
                    Some(path) => {
                        info!(path = %path.display(), "using embedded backend");
                        EmbeddedBackend::open(path.clone(), pragmas).await?
                    }
                    None => {
                        info!("using in-memory embedded backend");
                        EmbeddedBackend::open_in_memory().await?
                    }
                };
                Ok(Arc::new(backend))
            }
        }
    }
}
