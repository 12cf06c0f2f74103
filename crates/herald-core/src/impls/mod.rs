//! Implementations - concrete adapters for the ports.

pub mod memory_publisher;
pub mod memory_store;
pub mod sqlite_store;
pub mod tracing_publisher;

pub use memory_publisher::InMemoryStreamPublisher;
pub use memory_store::{InMemoryOutboxStore, MemoryTx};
pub use sqlite_store::{SqliteOutboxStore, SqliteTx};
pub use tracing_publisher::TracingPublisher;
