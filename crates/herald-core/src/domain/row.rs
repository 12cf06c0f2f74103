//! Outbox row: persisted state + state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Headers, LeaseToken, OutboxId, OutboxMessage, OutboxStatus, StoreError};

/// Upper bound on the stored `last_error`, in bytes (UTF-8), cut on a char
/// boundary.
pub const MAX_ERROR_LEN: usize = 2000;

/// Cut `error` down to at most `max` bytes on a char boundary.
pub fn truncate_error(error: &str, max: usize) -> String {
    if error.len() <= max {
        return error.to_string();
    }
    let mut end = max;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

/// Lease fields of a claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: LeaseToken,
    pub locked_until: DateTime<Utc>,
}

impl Lease {
    /// A lease is valid while `locked_until` has not passed.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.locked_until >= now
    }
}

/// One row of the outbox table.
///
/// This is the single source of truth for a row's state. The in-memory store
/// mutates rows only through the methods below; the SQLite store mirrors the
/// same transitions in SQL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: OutboxId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub status: OutboxStatus,

    /// Delivery attempts recorded so far. Never decreases.
    pub attempts: u32,

    /// The row must not be claimed before this instant.
    pub available_at: DateTime<Utc>,

    pub lease: Option<Lease>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRow {
    pub fn new(id: OutboxId, message: OutboxMessage, now: DateTime<Utc>) -> Self {
        Self {
            id,
            aggregate_type: message.aggregate.aggregate_type,
            aggregate_id: message.aggregate.aggregate_id,
            event_type: message.event_type,
            payload: message.payload,
            headers: message.headers,
            status: OutboxStatus::Pending,
            attempts: 0,
            available_at: now,
            lease: None,
            last_error: None,
            created_at: now,
            published_at: None,
        }
    }

    pub fn has_active_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_some_and(|lease| lease.is_active(now))
    }

    /// Eligible for `claim_batch` at `now`?
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && self.available_at <= now
            && !self.has_active_lease(now)
    }

    pub fn claim(&mut self, token: LeaseToken, locked_until: DateTime<Utc>) -> ClaimedRow {
        let lease = Lease {
            token,
            locked_until,
        };
        self.lease = Some(lease);
        ClaimedRow {
            id: self.id,
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            attempts: self.attempts,
            lease,
        }
    }

    /// Gate for outcome recording.
    ///
    /// `Ok(false)`: already terminal, nothing to do. `Err(LeaseLost)`: the
    /// row is pending but `token` is no longer its lease (expired and
    /// reclaimed by someone else).
    fn fence(&self, token: LeaseToken) -> Result<bool, StoreError> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        match self.lease {
            Some(lease) if lease.token == token => Ok(true),
            _ => Err(StoreError::LeaseLost(self.id)),
        }
    }

    /// Returns `Ok(false)` when the row was already terminal (nothing changed).
    pub fn mark_published(
        &mut self,
        token: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !self.fence(token)? {
            return Ok(false);
        }
        self.status = OutboxStatus::Published;
        self.published_at = Some(now);
        self.lease = None;
        Ok(true)
    }

    /// Record a failed attempt and push availability back.
    /// `available_at` never moves backwards.
    pub fn mark_failed(
        &mut self,
        token: LeaseToken,
        next_available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StoreError> {
        if !self.fence(token)? {
            return Ok(false);
        }
        self.status = OutboxStatus::Pending;
        self.attempts = self.attempts.saturating_add(1);
        self.available_at = self.available_at.max(next_available_at);
        self.last_error = Some(truncate_error(error, MAX_ERROR_LEN));
        self.lease = None;
        Ok(true)
    }

    /// Record a final failed attempt and dead-letter the row.
    pub fn mark_dead(&mut self, token: LeaseToken, error: &str) -> Result<bool, StoreError> {
        if !self.fence(token)? {
            return Ok(false);
        }
        self.status = OutboxStatus::Dead;
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(truncate_error(error, MAX_ERROR_LEN));
        self.lease = None;
        Ok(true)
    }

    /// Operator action: put a dead row back in line. Attempts are kept.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != OutboxStatus::Dead {
            return false;
        }
        self.status = OutboxStatus::Pending;
        self.available_at = self.available_at.max(now);
        self.lease = None;
        true
    }
}

/// Content of a row as returned by `claim_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRow {
    pub id: OutboxId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub headers: Headers,

    /// Attempts recorded before this claim.
    pub attempts: u32,

    /// The lease this claim holds. Outcomes must be recorded with its token.
    pub lease: Lease,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AggregateRef;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn row() -> OutboxRow {
        let msg = OutboxMessage::new(AggregateRef::new("todo", "t-1"), "todo.created", b"{}".to_vec());
        OutboxRow::new(OutboxId::new(1), msg, t0())
    }

    #[test]
    fn new_row_is_pending_and_due_now() {
        let row = row();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 0);
        assert!(row.is_claimable(t0()));
    }

    fn token() -> LeaseToken {
        LeaseToken::from_ulid(Ulid::new())
    }

    #[test]
    fn active_lease_blocks_claim_until_expiry() {
        let mut row = row();
        let token = token();
        let claimed = row.claim(token, t0() + Duration::seconds(30));
        assert_eq!(claimed.lease.token, token);

        assert!(!row.is_claimable(t0() + Duration::seconds(30)));
        assert!(row.is_claimable(t0() + Duration::seconds(31)));
    }

    #[test]
    fn failure_increments_attempts_and_never_moves_available_at_back() {
        let mut row = row();
        let first = token();
        row.claim(first, t0() + Duration::seconds(30));
        assert!(row.mark_failed(first, t0() + Duration::seconds(10), "boom").unwrap());
        assert_eq!(row.attempts, 1);
        assert_eq!(row.available_at, t0() + Duration::seconds(10));
        assert!(row.lease.is_none());

        let second = token();
        row.claim(second, t0() + Duration::seconds(40));
        row.mark_failed(second, t0() + Duration::seconds(5), "boom again")
            .unwrap();
        assert_eq!(row.attempts, 2);
        assert_eq!(row.available_at, t0() + Duration::seconds(10));
        assert_eq!(row.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn published_is_terminal() {
        let mut row = row();
        let token = token();
        row.claim(token, t0() + Duration::seconds(30));
        assert!(row.mark_published(token, t0()).unwrap());
        assert!(!row.mark_published(token, t0()).unwrap());
        assert!(!row.mark_failed(token, t0(), "late").unwrap());
        assert!(!row.mark_dead(token, "late").unwrap());
        assert_eq!(row.attempts, 0);
        assert!(!row.is_claimable(t0() + Duration::days(1)));
    }

    #[test]
    fn outcomes_from_a_superseded_lease_are_rejected() {
        let mut row = row();
        let stale = token();
        row.claim(stale, t0() + Duration::seconds(30));
        let live = token();
        let claimed = row.claim(live, t0() + Duration::seconds(61));

        for result in [
            row.mark_failed(stale, t0() + Duration::seconds(32), "late failure"),
            row.mark_dead(stale, "late dead"),
            row.mark_published(stale, t0()),
        ] {
            assert!(matches!(result, Err(StoreError::LeaseLost(id)) if id == row.id));
        }
        assert_eq!(row.lease, Some(claimed.lease));
        assert_eq!((row.status, row.attempts), (OutboxStatus::Pending, 0));

        assert!(row.mark_published(live, t0()).unwrap());
        assert_eq!(row.status, OutboxStatus::Published);
    }

    #[test]
    fn unclaimed_rows_reject_outcomes() {
        let mut row = row();
        assert!(matches!(
            row.mark_published(token(), t0()),
            Err(StoreError::LeaseLost(_))
        ));
        assert_eq!(row.status, OutboxStatus::Pending);
    }

    #[test]
    fn dead_rows_can_only_be_requeued() {
        let mut row = row();
        let token = token();
        row.claim(token, t0() + Duration::seconds(30));
        assert!(row.mark_dead(token, "bad payload").unwrap());
        assert_eq!(row.status, OutboxStatus::Dead);
        assert_eq!(row.attempts, 1);
        assert!(!row.is_claimable(t0()));

        assert!(row.requeue(t0()));
        assert_eq!(row.attempts, 1);
        assert!(row.is_claimable(t0()));
    }

    #[test]
    fn long_errors_are_truncated_on_char_boundary() {
        let error = "é".repeat(MAX_ERROR_LEN);
        let cut = truncate_error(&error, MAX_ERROR_LEN);
        assert!(cut.len() <= MAX_ERROR_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_error("short", MAX_ERROR_LEN), "short");
    }
}
