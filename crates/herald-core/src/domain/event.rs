//! StreamEvent - what the dispatcher hands to a stream publisher.

use serde::{Deserialize, Serialize};

use super::{Headers, OutboxId};

/// An event on its way to the broker.
///
/// `outbox_id` is stable across redeliveries, so consumers can use it as an
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Target stream / topic.
    pub stream: String,

    /// Partition or ordering key. The aggregate id by convention.
    pub key: String,

    pub outbox_id: OutboxId,
    pub event_type: String,
    pub aggregate_type: String,
    pub payload: Vec<u8>,

    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
}

impl StreamEvent {
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
