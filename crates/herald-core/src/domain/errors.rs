//! Errors - error types and their classification.

use thiserror::Error;

use super::OutboxId;

/// Classification of a dispatch failure.
///
/// - Transient: worth retrying with backoff (broker down, timeout).
/// - Permanent: retrying cannot help (undecodable payload); dead-letter now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Failure reading or writing the outbox table.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity, constraint violation, corrupt row, ...
    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0} not found")]
    NotFound(OutboxId),

    /// A transaction handle was passed to a store that did not open it.
    #[error("transaction handle belongs to a different store")]
    ForeignTransaction,

    /// The row was reclaimed under another lease; the outcome was not recorded.
    #[error("lease on {0} was lost to another claim")]
    LeaseLost(OutboxId),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Failure reported by a stream publisher.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected event: {0}")]
    Rejected(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure of an event handler while dispatching one row.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Decode(_) | HandlerError::Permanent(_) => ErrorKind::Permanent,
            HandlerError::Publish(_) | HandlerError::Transient(_) => ErrorKind::Transient,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Permanent
    }
}

/// Failure of the write path. The caller must roll back its transaction.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
