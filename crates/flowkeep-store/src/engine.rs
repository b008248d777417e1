//! Contracts consumed from the process-execution engine.
//!
//! The store never interprets process logic.  It only needs to know how to
//! ask a live instance for its identity and lifecycle status, how to detach
//! it from the running engine once its bytes are persisted, and how to
//! deliver a signal to it.  A [`ProcessDefinition`] is process-wide state
//! supplied by the engine at registration time; it is never serialized with
//! an instance.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Boxed error type used at the engine boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

/// Logical lifecycle state of a process instance.
///
/// Carried inside the opaque payload; the store never indexes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created but not yet started.
    Pending,
    /// Running or waiting on an event.
    Active,
    /// Reached an end node.
    Completed,
    /// Terminated externally.
    Aborted,
    /// Paused by an operator.
    Suspended,
    /// Stuck on an unhandled error, awaiting intervention.
    Error,
}

impl InstanceStatus {
    /// Whether the instance can never make progress again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Suspended => "suspended",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Live instance handle
// ---------------------------------------------------------------------------

/// A process instance attached to the running engine.
pub trait LiveInstance: Send + Sync {
    /// Instance id, unique within its process namespace.
    fn id(&self) -> &str;

    /// Id of the process definition this instance runs.
    fn process_id(&self) -> &str;

    /// Current lifecycle status.
    fn status(&self) -> InstanceStatus;

    /// Deliver an asynchronous signal (e.g. a fired timer) to the instance.
    fn signal(&mut self, signal: &str, payload: &serde_json::Value) -> Result<(), BoxError>;

    /// Release any runtime handles held by the instance.
    ///
    /// Called once the encoded bytes have been persisted and become the
    /// source of truth.  The default does nothing.
    fn disconnect(&mut self) {}

    /// Access to the concrete type, for marshallers.
    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------------
// Process definition
// ---------------------------------------------------------------------------

/// A registered process definition.
pub trait ProcessDefinition: Send + Sync {
    /// Process id; also the namespace its instances are stored under.
    fn process_id(&self) -> &str;

    /// Name of the marshaller that encodes this process's instances.
    fn marshaller(&self) -> &str;

    /// Create and start a new instance.
    fn start_instance(
        &self,
        instance_id: &str,
        trigger: &serde_json::Value,
    ) -> Result<Box<dyn LiveInstance>, BoxError>;
}
