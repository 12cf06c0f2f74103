//! OutboxMessage - what a producer hands to the writer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Optional key/value metadata stored next to the payload.
///
/// Payload schemas evolve through the `schema` header, never through
/// migrations of the outbox table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub const SCHEMA: &'static str = "schema";
    pub const SOURCE: &'static str = "source";

    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn schema_version(&self) -> Option<&str> {
        self.get(Self::SCHEMA)
    }

    pub fn source(&self) -> Option<&str> {
        self.get(Self::SOURCE)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// The business entity an event is about (e.g. `todo` / `01J...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub aggregate_type: String,
    pub aggregate_id: String,
}

impl AggregateRef {
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }
}

/// A message about to be written to the outbox.
///
/// Status, attempts and timestamps are owned by the store, so they are
/// not part of this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub aggregate: AggregateRef,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl OutboxMessage {
    pub fn new(aggregate: AggregateRef, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            aggregate,
            event_type: event_type.into(),
            payload,
            headers: Headers::new(),
        }
    }

    /// Build a message whose payload is the JSON encoding of `body`.
    pub fn json<T: Serialize>(
        aggregate: AggregateRef,
        event_type: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::new(aggregate, event_type, payload))
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_expose_schema_and_source() {
        let headers = Headers::new().with("schema", "v1").with("source", "api");
        assert_eq!(headers.schema_version(), Some("v1"));
        assert_eq!(headers.source(), Some("api"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn headers_serialize_as_flat_object() {
        let headers: Headers = [("schema", "v2")].into_iter().collect();
        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(json, r#"{"schema":"v2"}"#);
    }

    #[test]
    fn json_message_encodes_body() {
        let msg = OutboxMessage::json(
            AggregateRef::new("todo", "t-1"),
            "todo.created",
            &serde_json::json!({"description": "buy milk"}),
        )
        .unwrap()
        .with_headers(Headers::new().with("schema", "v1"));

        assert_eq!(msg.event_type, "todo.created");
        assert_eq!(msg.aggregate.aggregate_type, "todo");
        let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body["description"], "buy milk");
        assert_eq!(msg.headers.schema_version(), Some("v1"));
    }
}
