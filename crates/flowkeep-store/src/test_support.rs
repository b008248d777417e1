//! Minimal engine used by the unit tests.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{InstanceMarshaller, SerdeMarshaller, StateCodec};
use crate::engine::{BoxError, InstanceStatus, LiveInstance, ProcessDefinition};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub id: String,
    pub process_id: String,
    pub ticks: u32,
    pub status: InstanceStatus,
    #[serde(skip)]
    pub disconnected: bool,
}

impl Counter {
    pub fn new(process_id: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            process_id: process_id.to_string(),
            ticks: 0,
            status: InstanceStatus::Active,
            disconnected: false,
        }
    }
}

impl LiveInstance for Counter {
    fn id(&self) -> &str {
        &self.id
    }

    fn process_id(&self) -> &str {
        &self.process_id
    }

    fn status(&self) -> InstanceStatus {
        self.status
    }

    fn signal(&mut self, signal: &str, _payload: &serde_json::Value) -> Result<(), BoxError> {
        match signal {
            "finish" => self.status = InstanceStatus::Completed,
            "explode" => return Err("counter exploded".into()),
            _ => self.ticks += 1,
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.disconnected = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CounterProcess {
    process_id: String,
}

impl CounterProcess {
    pub fn new(process_id: &str) -> Self {
        Self {
            process_id: process_id.to_string(),
        }
    }
}

impl ProcessDefinition for CounterProcess {
    fn process_id(&self) -> &str {
        &self.process_id
    }

    fn marshaller(&self) -> &str {
        "counter"
    }

    fn start_instance(
        &self,
        instance_id: &str,
        _trigger: &serde_json::Value,
    ) -> Result<Box<dyn LiveInstance>, BoxError> {
        Ok(Box::new(Counter::new(&self.process_id, instance_id)))
    }
}

pub fn counter_codec() -> StateCodec {
    let codec = StateCodec::new();
    codec.register(Arc::new(SerdeMarshaller::<Counter>::new("counter")));
    codec
}

/// Decodes counters but refuses to encode them.
pub struct RefusingMarshaller {
    decoder: SerdeMarshaller<Counter>,
}

impl InstanceMarshaller for RefusingMarshaller {
    fn name(&self) -> &str {
        "counter"
    }

    fn marshal(&self, _instance: &dyn LiveInstance) -> Result<Vec<u8>, BoxError> {
        Err("counter refuses to be written".into())
    }

    fn unmarshal(
        &self,
        payload: &[u8],
        definition: &dyn ProcessDefinition,
    ) -> Result<Box<dyn LiveInstance>, BoxError> {
        self.decoder.unmarshal(payload, definition)
    }
}

pub fn refusing_codec() -> StateCodec {
    let codec = StateCodec::new();
    codec.register(Arc::new(RefusingMarshaller {
        decoder: SerdeMarshaller::new("counter"),
    }));
    codec
}
