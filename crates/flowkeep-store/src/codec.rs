//! Binary state codec.
//!
//! Every persisted instance is framed so that one store can hold instances
//! produced by different marshallers:
//!
//! ```text
//! ┌────────┬──────────────┬──────────────────┬─────────────────────┐
//! │ format │ name length  │ marshaller name  │ marshaller payload  │
//! │ 1 byte │ u16 (BE)     │ UTF-8            │ opaque              │
//! └────────┴──────────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! Decoding reads the marshaller name first and dispatches to the
//! [`InstanceMarshaller`] registered under it.  Marshallers are registered
//! when their process is registered, never discovered at runtime.

use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::engine::{BoxError, LiveInstance, ProcessDefinition};

/// Current frame format.
pub const FORMAT_VERSION: u8 = 1;

/// Bytes preceding the marshaller name.
const HEADER_LEN: usize = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a frame could not be produced or read.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No marshaller is registered under the name found in the frame.
    #[error("unknown marshaller `{0}`")]
    UnknownMarshaller(String),

    /// The frame ended before the named section was complete.
    #[error("truncated frame: missing {0}")]
    Truncated(&'static str),

    /// The frame was written by an unsupported format revision.
    #[error("unsupported frame format {0}")]
    UnsupportedFormat(u8),

    /// The marshaller name is not valid UTF-8 or is too long to frame.
    #[error("invalid marshaller name: {0}")]
    InvalidName(String),

    /// The marshaller itself failed.
    #[error("marshaller `{marshaller}` failed: {source}")]
    Marshaller {
        marshaller: String,
        #[source]
        source: BoxError,
    },
}

// ---------------------------------------------------------------------------
// Marshaller strategy
// ---------------------------------------------------------------------------

/// Engine-specific serialization strategy for one kind of instance.
pub trait InstanceMarshaller: Send + Sync {
    /// Discriminator written in front of every payload this marshaller
    /// produces.
    fn name(&self) -> &str;

    /// Serialize a live instance.  Must not mutate it.
    fn marshal(&self, instance: &dyn LiveInstance) -> Result<Vec<u8>, BoxError>;

    /// Rebuild a runnable instance bound to `definition`.
    fn unmarshal(
        &self,
        payload: &[u8],
        definition: &dyn ProcessDefinition,
    ) -> Result<Box<dyn LiveInstance>, BoxError>;
}

/// JSON marshaller for instance types that are plain serde data.
///
/// The decoded instance must belong to the definition it is bound to;
/// a payload naming a different process is rejected.
pub struct SerdeMarshaller<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeMarshaller<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> InstanceMarshaller for SerdeMarshaller<T>
where
    T: LiveInstance + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn marshal(&self, instance: &dyn LiveInstance) -> Result<Vec<u8>, BoxError> {
        let concrete = instance.as_any().downcast_ref::<T>().ok_or_else(|| {
            format!(
                "instance {} is not a {}",
                instance.id(),
                std::any::type_name::<T>()
            )
        })?;
        Ok(serde_json::to_vec(concrete)?)
    }

    fn unmarshal(
        &self,
        payload: &[u8],
        definition: &dyn ProcessDefinition,
    ) -> Result<Box<dyn LiveInstance>, BoxError> {
        let instance: T = serde_json::from_slice(payload)?;
        if instance.process_id() != definition.process_id() {
            return Err(format!(
                "instance {} belongs to process {}, not {}",
                instance.id(),
                instance.process_id(),
                definition.process_id()
            )
            .into());
        }
        Ok(Box::new(instance))
    }
}

// ---------------------------------------------------------------------------
// StateCodec
// ---------------------------------------------------------------------------

/// Registry of marshallers plus the framing logic.
///
/// Cheaply cloneable; clones share the same registry.
#[derive(Clone, Default)]
pub struct StateCodec {
    marshallers: Arc<DashMap<String, Arc<dyn InstanceMarshaller>>>,
}

impl StateCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a marshaller under its own name, replacing any previous one.
    pub fn register(&self, marshaller: Arc<dyn InstanceMarshaller>) {
        let name = marshaller.name().to_string();
        debug!(marshaller = %name, "marshaller registered");
        self.marshallers.insert(name, marshaller);
    }

    /// Whether a marshaller is registered under `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.marshallers.contains_key(name)
    }

    /// Encode `instance` with the marshaller registered as `marshaller`.
    pub fn encode(
        &self,
        marshaller: &str,
        instance: &dyn LiveInstance,
    ) -> Result<Vec<u8>, CodecError> {
        let strategy = self.lookup(marshaller)?;
        let name_len = u16::try_from(marshaller.len()).map_err(|_| {
            CodecError::InvalidName(format!("{} bytes exceeds u16", marshaller.len()))
        })?;

        let payload = strategy
            .marshal(instance)
            .map_err(|source| CodecError::Marshaller {
                marshaller: marshaller.to_string(),
                source,
            })?;

        let mut frame = Vec::with_capacity(HEADER_LEN + marshaller.len() + payload.len());
        frame.push(FORMAT_VERSION);
        frame.extend_from_slice(&name_len.to_be_bytes());
        frame.extend_from_slice(marshaller.as_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a frame into a live instance bound to `definition`.
    pub fn decode(
        &self,
        bytes: &[u8],
        definition: &dyn ProcessDefinition,
    ) -> Result<Box<dyn LiveInstance>, CodecError> {
        let (name, payload) = split_frame(bytes)?;
        let strategy = self.lookup(name)?;
        strategy
            .unmarshal(payload, definition)
            .map_err(|source| CodecError::Marshaller {
                marshaller: name.to_string(),
                source,
            })
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn InstanceMarshaller>, CodecError> {
        self.marshallers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CodecError::UnknownMarshaller(name.to_string()))
    }
}

/// Read the marshaller name of a frame without decoding its payload.
pub fn peek_marshaller(bytes: &[u8]) -> Result<&str, CodecError> {
    split_frame(bytes).map(|(name, _)| name)
}

fn split_frame(bytes: &[u8]) -> Result<(&str, &[u8]), CodecError> {
    let (&format, rest) = bytes
        .split_first()
        .ok_or(CodecError::Truncated("format byte"))?;
    if format != FORMAT_VERSION {
        return Err(CodecError::UnsupportedFormat(format));
    }
    if rest.len() < 2 {
        return Err(CodecError::Truncated("marshaller name length"));
    }
    let name_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    let rest = &rest[2..];
    if rest.len() < name_len {
        return Err(CodecError::Truncated("marshaller name"));
    }
    let (name, payload) = rest.split_at(name_len);
    let name =
        std::str::from_utf8(name).map_err(|e| CodecError::InvalidName(e.to_string()))?;
    Ok((name, payload))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
