//! Domain model (ids, messages, rows, status, errors).
//!
//! Pure data and state transitions. Nothing here talks to a database,
//! a broker or a clock; the `ports` layer supplies those.

pub mod errors;
pub mod event;
pub mod ids;
pub mod message;
pub mod row;
pub mod status;

pub use self::errors::{ErrorKind, HandlerError, PublishError, StoreError, WriteError};
pub use self::event::StreamEvent;
pub use self::ids::{LeaseToken, OutboxId};
pub use self::message::{AggregateRef, Headers, OutboxMessage};
pub use self::row::{ClaimedRow, Lease, OutboxRow, truncate_error, MAX_ERROR_LEN};
pub use self::status::{OutboxCounts, OutboxStatus};
