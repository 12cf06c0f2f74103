//! OutboxStore port - durable table of pending / published events.
//!
//! # Design
//! - `insert` runs inside the caller's transaction, so the event commits or
//!   rolls back together with the business write that produced it.
//! - `claim_batch` is the only operation that needs its own atomicity:
//!   select-and-lock happens as one unit, so two dispatchers never receive
//!   the same row while both leases are valid.
//! - Outcome recording (`mark_*`) touches a single row and is fenced by the
//!   claim's lease token. A terminal row is left as is; a pending row held
//!   under another token yields `StoreError::LeaseLost` and is not written.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    ClaimedRow, LeaseToken, OutboxCounts, OutboxId, OutboxMessage, OutboxRow, StoreError,
};

/// Transaction handle opened on the store's database.
///
/// Dropping a handle without calling `commit` rolls it back.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    type Tx: Transaction;

    /// Open a transaction for a business write plus its outbox insert.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Append a `pending` row with `attempts = 0` and `available_at = now`.
    /// Visible to dispatchers only once `tx` commits.
    async fn insert(&self, tx: &mut Self::Tx, message: OutboxMessage) -> Result<(), StoreError>;

    /// Atomically lease up to `limit` due rows, oldest id first.
    ///
    /// A row is due when it is pending, `available_at <= now` and it holds
    /// no valid lease. Losing the race to another dispatcher is not an error:
    /// the result is just shorter, possibly empty.
    async fn claim_batch(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedRow>, StoreError>;

    /// Terminal success. Idempotent: a terminal row is left untouched.
    async fn mark_published(&self, id: OutboxId, token: LeaseToken) -> Result<(), StoreError>;

    /// Record a failed attempt: `attempts += 1`, lease cleared, row becomes
    /// due again at `next_available_at`. `error` is stored truncated.
    async fn mark_failed(
        &self,
        id: OutboxId,
        token: LeaseToken,
        next_available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Record a final failed attempt and dead-letter the row.
    async fn mark_dead(
        &self,
        id: OutboxId,
        token: LeaseToken,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Move a dead row back to pending, due now. Attempts are kept.
    async fn requeue_dead(&self, id: OutboxId) -> Result<(), StoreError>;

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRow>, StoreError>;

    async fn counts(&self) -> Result<OutboxCounts, StoreError>;
}
