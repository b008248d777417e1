//! Process instances as handed out by the store.
//!
//! A [`ProcessInstance`] is in one of two states:
//!
//! ```text
//!   Live { handle }  ──create/update──>  Disconnected { bytes, version }
//!        ^                                        │
//!        └───────────────── connect ──────────────┘
//! ```
//!
//! After a successful write the live handle is released and only the bytes
//! that were persisted are kept.  Nothing is refetched until the caller
//! asks: [`ProcessInstance::reload`] reads the backend at most once for the
//! lifetime of the instance, and [`ProcessInstance::connect`] decodes the
//! latest known bytes back into a runnable handle.

use std::fmt;

use tracing::debug;

use crate::engine::{InstanceStatus, LiveInstance};
use crate::error::{StoreError, StoreResult};
use crate::store::ProcessInstanceStore;

/// Outcome of the one backend read a disconnected instance may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    /// No reload attempted yet.
    Pending,
    /// Reloaded; the bytes are the stored ones as of that read.
    Reloaded,
    /// The record was gone when the reload ran.
    Vanished,
}

enum InstanceState {
    Live(Box<dyn LiveInstance>),
    Disconnected {
        payload: Vec<u8>,
        reload: ReloadState,
    },
}

/// A process instance plus the version stamp captured for it.
pub struct ProcessInstance {
    id: String,
    process_id: String,
    version: Option<u64>,
    state: InstanceState,
}

impl ProcessInstance {
    /// Wrap a freshly started instance, not yet stored.
    pub fn new(handle: Box<dyn LiveInstance>) -> Self {
        Self::live(handle, None)
    }

    pub(crate) fn live(handle: Box<dyn LiveInstance>, version: Option<u64>) -> Self {
        Self {
            id: handle.id().to_string(),
            process_id: handle.process_id().to_string(),
            version,
            state: InstanceState::Live(handle),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Version stamp used as the expected value of the next `update`.
    ///
    /// `None` on backends without versioning, for plain reads, and for
    /// instances never stored.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, InstanceState::Live(_))
    }

    /// Status of the live handle; `None` while disconnected.
    pub fn status(&self) -> Option<InstanceStatus> {
        self.handle().map(|h| h.status())
    }

    pub fn handle(&self) -> Option<&dyn LiveInstance> {
        match &self.state {
            InstanceState::Live(handle) => Some(handle.as_ref()),
            InstanceState::Disconnected { .. } => None,
        }
    }

    pub fn handle_mut(&mut self) -> Option<&mut dyn LiveInstance> {
        match &mut self.state {
            InstanceState::Live(handle) => Some(handle.as_mut()),
            InstanceState::Disconnected { .. } => None,
        }
    }

    /// Last known stored bytes; `None` while live.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.state {
            InstanceState::Live(_) => None,
            InstanceState::Disconnected { payload, .. } => Some(payload),
        }
    }

    /// Reload progress; `None` while live.
    pub fn reload_state(&self) -> Option<ReloadState> {
        match &self.state {
            InstanceState::Live(_) => None,
            InstanceState::Disconnected { reload, .. } => Some(*reload),
        }
    }

    /// Release the live handle after `payload` was written at `version`.
    pub(crate) fn disconnect(&mut self, payload: Vec<u8>, version: Option<u64>) {
        if let InstanceState::Live(handle) = &mut self.state {
            handle.disconnect();
        }
        self.version = version;
        self.state = InstanceState::Disconnected {
            payload,
            reload: ReloadState::Pending,
        };
        debug!(instance_id = %self.id, ?version, "instance disconnected");
    }

    /// Refresh the stored bytes and version from the backend.
    ///
    /// The first call on a disconnected instance issues one read; later
    /// calls return the memoized outcome.  Returns whether the record still
    /// exists.  A live instance is current by definition and is not read.
    pub async fn reload(&mut self, store: &ProcessInstanceStore) -> StoreResult<bool> {
        let InstanceState::Disconnected { payload, reload } = &mut self.state else {
            return Ok(true);
        };
        match *reload {
            ReloadState::Reloaded => return Ok(true),
            ReloadState::Vanished => return Ok(false),
            ReloadState::Pending => {}
        }

        match store.fetch_record(&self.id).await? {
            Some(record) => {
                *payload = record.payload;
                *reload = ReloadState::Reloaded;
                self.version = record.version;
                debug!(instance_id = %self.id, version = ?self.version, "instance reloaded");
                Ok(true)
            }
            None => {
                *reload = ReloadState::Vanished;
                debug!(instance_id = %self.id, "instance vanished before reload");
                Ok(false)
            }
        }
    }

    /// Decode the latest known bytes back into a live handle.
    ///
    /// Fails if a previous reload found the record gone.
    pub fn connect(&mut self, store: &ProcessInstanceStore) -> StoreResult<&mut dyn LiveInstance> {
        if let InstanceState::Disconnected { payload, reload } = &self.state {
            if *reload == ReloadState::Vanished {
                return Err(StoreError::InvalidArgument(format!(
                    "instance {}/{} no longer exists",
                    self.process_id, self.id
                )));
            }
            let handle = store.decode(&self.id, payload)?;
            self.state = InstanceState::Live(handle);
        }
        match &mut self.state {
            InstanceState::Live(handle) => Ok(handle.as_mut()),
            InstanceState::Disconnected { .. } => Err(StoreError::InvalidArgument(format!(
                "instance {}/{} could not be connected",
                self.process_id, self.id
            ))),
        }
    }
}

impl fmt::Debug for ProcessInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ProcessInstance");
        s.field("id", &self.id)
            .field("process_id", &self.process_id)
            .field("version", &self.version);
        match &self.state {
            InstanceState::Live(handle) => s.field("status", &handle.status()),
            InstanceState::Disconnected { payload, reload } => s
                .field("payload_bytes", &payload.len())
                .field("reload", reload),
        };
        s.finish()
    }
}

// ── tests ────────────────────────────────────────────────────────────
