//! Event trait - ties a Rust type to its `event_type` string.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::AggregateRef;

/// A typed outbox event.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct TodoCreated { id: String, description: String }
///
/// impl Event for TodoCreated {
///     const EVENT_TYPE: &'static str = "todo.created";
///     const AGGREGATE_TYPE: &'static str = "todo";
///     fn aggregate_id(&self) -> String { self.id.clone() }
/// }
/// ```
///
/// `EVENT_TYPE` is what gets persisted, so renaming it orphans rows that
/// are already in the outbox. Version payloads via the `schema` header
/// instead.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
    const AGGREGATE_TYPE: &'static str;

    fn aggregate_id(&self) -> String;

    fn aggregate(&self) -> AggregateRef {
        AggregateRef::new(Self::AGGREGATE_TYPE, self.aggregate_id())
    }
}
