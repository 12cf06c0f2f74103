//! In-memory outbox store.
//!
//! Besides the outbox table it keeps a small set of "business tables"
//! (`table -> key -> JSON`), so a `MemoryTx` can stage a business write and
//! its outbox row and apply both under a single lock acquisition.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    ClaimedRow, LeaseToken, OutboxCounts, OutboxId, OutboxMessage, OutboxRow, OutboxStatus,
    StoreError,
};
use crate::ports::{
    Clock, LeaseTokenGenerator, OutboxStore, SystemClock, Transaction, UlidTokenGenerator,
    offset_by,
};

/// In-memory store state.
#[derive(Default)]
struct MemoryState {
    /// Outbox rows keyed (and therefore ordered) by id.
    rows: BTreeMap<OutboxId, OutboxRow>,

    /// Business tables written through `MemoryTx::put_record`.
    tables: HashMap<String, BTreeMap<String, serde_json::Value>>,

    /// Next row id to assign.
    next_id: u64,
}

impl MemoryState {
    fn allocate_id(&mut self) -> OutboxId {
        self.next_id += 1;
        OutboxId::new(self.next_id)
    }

    fn row_mut(&mut self, id: OutboxId) -> Result<&mut OutboxRow, StoreError> {
        self.rows.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

/// In-memory outbox store.
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn LeaseTokenGenerator>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let tokens = Arc::new(UlidTokenGenerator::new(Arc::clone(&clock)));
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
            tokens,
        }
    }

    /// Committed records of a business table, ordered by key.
    pub async fn records(&self, table: &str) -> Vec<(String, serde_json::Value)> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|records| records.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every outbox row, ordered by id.
    pub async fn rows(&self) -> Vec<OutboxRow> {
        let state = self.state.lock().await;
        state.rows.values().cloned().collect()
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction on an `InMemoryOutboxStore`.
///
/// Nothing is visible to other callers until `commit`. Rollback (explicit or
/// by drop) simply discards the staged writes.
pub struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    records: Vec<(String, String, serde_json::Value)>,
    messages: Vec<(OutboxMessage, DateTime<Utc>)>,
}

impl MemoryTx {
    /// Stage a business record write (upsert).
    pub fn put_record(
        &mut self,
        table: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        self.records.push((table.into(), key.into(), value));
    }

    pub fn staged_messages(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for (table, key, value) in self.records {
            state.tables.entry(table).or_default().insert(key, value);
        }
        for (message, inserted_at) in self.messages {
            let id = state.allocate_id();
            state.rows.insert(id, OutboxRow::new(id, message, inserted_at));
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx {
            state: Arc::clone(&self.state),
            records: Vec::new(),
            messages: Vec::new(),
        })
    }

    async fn insert(&self, tx: &mut MemoryTx, message: OutboxMessage) -> Result<(), StoreError> {
        if !Arc::ptr_eq(&tx.state, &self.state) {
            return Err(StoreError::ForeignTransaction);
        }
        tx.messages.push((message, self.clock.now()));
        Ok(())
    }

    async fn claim_batch(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedRow>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let token = self.tokens.next_token();
        let locked_until = offset_by(now, lease);

        // select and lock under one acquisition
        let mut state = self.state.lock().await;
        let claimed = state
            .rows
            .values_mut()
            .filter(|row| row.is_claimable(now))
            .take(limit)
            .map(|row| row.claim(token, locked_until))
            .collect();
        Ok(claimed)
    }

    async fn mark_published(&self, id: OutboxId, token: LeaseToken) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.row_mut(id)?.mark_published(token, now)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: OutboxId,
        token: LeaseToken,
        next_available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.row_mut(id)?.mark_failed(token, next_available_at, error)?;
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: OutboxId,
        token: LeaseToken,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.row_mut(id)?.mark_dead(token, error)?;
        Ok(())
    }

    async fn requeue_dead(&self, id: OutboxId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.row_mut(id)?.requeue(now);
        Ok(())
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.get(&id).cloned())
    }

    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut counts = OutboxCounts::default();
        for row in state.rows.values() {
            match row.status {
                OutboxStatus::Pending => {
                    counts.pending += 1;
                    if row.has_active_lease(now) {
                        counts.leased += 1;
                    }
                }
                OutboxStatus::Published => counts.published += 1,
                OutboxStatus::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }
}
