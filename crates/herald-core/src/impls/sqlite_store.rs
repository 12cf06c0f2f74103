//! SQLite outbox store (rusqlite).
//!
//! One connection behind an async mutex. A `SqliteTx` holds that mutex for
//! its whole lifetime, so business SQL and the outbox insert run on the same
//! connection inside one `BEGIN IMMEDIATE` transaction.
//!
//! Timestamps are stored as unix milliseconds.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::domain::{
    ClaimedRow, Headers, Lease, LeaseToken, MAX_ERROR_LEN, OutboxCounts, OutboxId, OutboxMessage,
    OutboxRow, OutboxStatus, StoreError, truncate_error,
};
use crate::ports::{
    Clock, LeaseTokenGenerator, OutboxStore, SystemClock, Transaction, UlidTokenGenerator,
    offset_by,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS outbox (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    aggregate_type  TEXT    NOT NULL,
    aggregate_id    TEXT    NOT NULL,
    event_type      TEXT    NOT NULL,
    payload         BLOB    NOT NULL,
    headers         TEXT,
    status          TEXT    NOT NULL DEFAULT 'pending',
    attempts        INTEGER NOT NULL DEFAULT 0,
    available_at    INTEGER NOT NULL,
    lock_token      TEXT,
    locked_until    INTEGER,
    last_error      TEXT,
    created_at      INTEGER NOT NULL,
    published_at    INTEGER
);
CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox (status, available_at, id);
CREATE INDEX IF NOT EXISTS idx_outbox_lock_token ON outbox (lock_token);
CREATE INDEX IF NOT EXISTS idx_outbox_aggregate ON outbox (aggregate_type, aggregate_id);
";

const ROW_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, headers, \
     status, attempts, available_at, lock_token, locked_until, last_error, created_at, published_at";

/// SQLite-backed outbox store.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn LeaseTokenGenerator>,
}

impl SqliteOutboxStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection and make sure the outbox table exists.
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tokens: Arc::new(UlidTokenGenerator::new(Arc::clone(&clock))),
            clock,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.tokens = Arc::new(UlidTokenGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    /// Run extra DDL, e.g. the business tables that share this database.
    pub async fn migrate(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run a read-only closure against the connection.
    pub async fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().await;
        Ok(f(&conn)?)
    }
}

/// Transaction on a `SqliteOutboxStore`.
///
/// Holds the connection lock until commit / rollback / drop. Do not call
/// other store methods while a `SqliteTx` is alive on the same task.
pub struct SqliteTx {
    conn: OwnedMutexGuard<Connection>,
    owner: Arc<Mutex<Connection>>,
    finished: bool,
}

impl SqliteTx {
    /// Connection for the business write.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// A failed COMMIT leaves `finished` unset so drop still rolls back.
    fn finish(&mut self, sql: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(sql)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = self.conn.execute_batch("ROLLBACK")
        {
            warn!(error = %e, "rollback of dropped outbox transaction failed");
        }
    }
}

#[async_trait]
impl Transaction for SqliteTx {
    async fn commit(mut self) -> Result<(), StoreError> {
        self.finish("COMMIT")
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.finish("ROLLBACK")
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn read_headers(row: &Row<'_>, column: usize) -> rusqlite::Result<Headers> {
    match row.get::<_, Option<String>>(column)? {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| conversion_error(column, e)),
        None => Ok(Headers::new()),
    }
}

fn read_lease(row: &Row<'_>, token_col: usize, until_col: usize) -> rusqlite::Result<Option<Lease>> {
    let token: Option<String> = row.get(token_col)?;
    let until: Option<i64> = row.get(until_col)?;
    match (token, until) {
        (Some(token), Some(until)) => {
            let token = token
                .parse::<LeaseToken>()
                .map_err(|e| conversion_error(token_col, e))?;
            Ok(Some(Lease {
                token,
                locked_until: from_ms(until),
            }))
        }
        _ => Ok(None),
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<OutboxRow> {
    let status: String = row.get(6)?;
    let status = OutboxStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            Type::Text,
            format!("unknown outbox status '{status}'").into(),
        )
    })?;
    Ok(OutboxRow {
        id: OutboxId::new(row.get::<_, i64>(0)? as u64),
        aggregate_type: row.get(1)?,
        aggregate_id: row.get(2)?,
        event_type: row.get(3)?,
        payload: row.get(4)?,
        headers: read_headers(row, 5)?,
        status,
        attempts: row.get(7)?,
        available_at: from_ms(row.get(8)?),
        lease: read_lease(row, 9, 10)?,
        last_error: row.get(11)?,
        created_at: from_ms(row.get(12)?),
        published_at: row.get::<_, Option<i64>>(13)?.map(from_ms),
    })
}

fn read_claimed(row: &Row<'_>) -> rusqlite::Result<ClaimedRow> {
    Ok(ClaimedRow {
        id: OutboxId::new(row.get::<_, i64>(0)? as u64),
        aggregate_type: row.get(1)?,
        aggregate_id: row.get(2)?,
        event_type: row.get(3)?,
        payload: row.get(4)?,
        headers: read_headers(row, 5)?,
        attempts: row.get(6)?,
        lease: read_lease(row, 7, 8)?.ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                Type::Null,
                "claimed row has no lease".into(),
            )
        })?,
    })
}

/// UPDATE ... LIMIT via subquery, then read back by token, in one
/// immediate transaction.
fn claim_rows(
    conn: &mut Connection,
    token: LeaseToken,
    now_ms: i64,
    until_ms: i64,
    limit: i64,
) -> rusqlite::Result<Vec<ClaimedRow>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let token = token.to_string();
    tx.execute(
        "UPDATE outbox
         SET lock_token = ?1, locked_until = ?2
         WHERE id IN (
             SELECT id FROM outbox
             WHERE status = 'pending'
               AND available_at <= ?3
               AND (locked_until IS NULL OR locked_until < ?3)
             ORDER BY id
             LIMIT ?4
         )",
        params![token, until_ms, now_ms, limit],
    )?;
    let claimed = {
        let mut stmt = tx.prepare(
            "SELECT id, aggregate_type, aggregate_id, event_type, payload, headers,
                    attempts, lock_token, locked_until
             FROM outbox
             WHERE lock_token = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![token], read_claimed)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    tx.commit()?;
    Ok(claimed)
}

fn ensure_exists(conn: &Connection, id: OutboxId) -> Result<(), StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM outbox WHERE id = ?1",
            params![id.get() as i64],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(StoreError::NotFound(id)),
    }
}

/// Run a single-row update; zero affected rows means either "already in a
/// state this transition ignores" (fine) or "no such row" (NotFound).
fn update_one(
    conn: &Connection,
    id: OutboxId,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<(), StoreError> {
    let changed = conn.execute(sql, params)?;
    if changed == 0 {
        ensure_exists(conn, id)?;
    }
    Ok(())
}

/// Run an outcome update fenced by `lock_token`. Zero affected rows means
/// the row is terminal (fine), held under another lease (`LeaseLost`) or
/// missing (`NotFound`).
fn update_leased(
    conn: &Connection,
    id: OutboxId,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<(), StoreError> {
    if conn.execute(sql, params)? > 0 {
        return Ok(());
    }
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM outbox WHERE id = ?1",
            params![id.get() as i64],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref().map(OutboxStatus::parse) {
        None => Err(StoreError::NotFound(id)),
        Some(Some(OutboxStatus::Pending)) => Err(StoreError::LeaseLost(id)),
        Some(_) => Ok(()),
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    type Tx = SqliteTx;

    async fn begin(&self) -> Result<SqliteTx, StoreError> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(SqliteTx {
            conn,
            owner: Arc::clone(&self.conn),
            finished: false,
        })
    }

    async fn insert(&self, tx: &mut SqliteTx, message: OutboxMessage) -> Result<(), StoreError> {
        if !Arc::ptr_eq(&tx.owner, &self.conn) {
            return Err(StoreError::ForeignTransaction);
        }
        let headers = if message.headers.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&message.headers)
                    .map_err(|e| StoreError::Storage(format!("encode headers: {e}")))?,
            )
        };
        let now = to_ms(self.clock.now());
        tx.conn.execute(
            "INSERT INTO outbox
                 (aggregate_type, aggregate_id, event_type, payload, headers,
                  status, attempts, available_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
            params![
                message.aggregate.aggregate_type,
                message.aggregate.aggregate_id,
                message.event_type,
                message.payload,
                headers,
                now,
            ],
        )?;
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
        let until = offset_by(now, lease);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut conn = self.conn.lock().await;
        Ok(claim_rows(&mut conn, token, to_ms(now), to_ms(until), limit)?)
    }

    async fn mark_published(&self, id: OutboxId, token: LeaseToken) -> Result<(), StoreError> {
        let now = to_ms(self.clock.now());
        let conn = self.conn.lock().await;
        update_leased(
            &conn,
            id,
            "UPDATE outbox
             SET status = 'published', published_at = ?2, lock_token = NULL, locked_until = NULL
             WHERE id = ?1 AND status = 'pending' AND lock_token = ?3",
            params![id.get() as i64, now, token.to_string()],
        )
    }

    async fn mark_failed(
        &self,
        id: OutboxId,
        token: LeaseToken,
        next_available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let error = truncate_error(error, MAX_ERROR_LEN);
        let conn = self.conn.lock().await;
        update_leased(
            &conn,
            id,
            "UPDATE outbox
             SET attempts = attempts + 1,
                 available_at = MAX(available_at, ?2),
                 last_error = ?3,
                 lock_token = NULL,
                 locked_until = NULL
             WHERE id = ?1 AND status = 'pending' AND lock_token = ?4",
            params![id.get() as i64, to_ms(next_available_at), error, token.to_string()],
        )
    }

    async fn mark_dead(
        &self,
        id: OutboxId,
        token: LeaseToken,
        error: &str,
    ) -> Result<(), StoreError> {
        let error = truncate_error(error, MAX_ERROR_LEN);
        let conn = self.conn.lock().await;
        update_leased(
            &conn,
            id,
            "UPDATE outbox
             SET status = 'dead',
                 attempts = attempts + 1,
                 last_error = ?2,
                 lock_token = NULL,
                 locked_until = NULL
             WHERE id = ?1 AND status = 'pending' AND lock_token = ?3",
            params![id.get() as i64, error, token.to_string()],
        )
    }

    async fn requeue_dead(&self, id: OutboxId) -> Result<(), StoreError> {
        let now = to_ms(self.clock.now());
        let conn = self.conn.lock().await;
        update_one(
            &conn,
            id,
            "UPDATE outbox
             SET status = 'pending',
                 available_at = MAX(available_at, ?2),
                 lock_token = NULL,
                 locked_until = NULL
             WHERE id = ?1 AND status = 'dead'",
            params![id.get() as i64, now],
        )
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRow>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {ROW_COLUMNS} FROM outbox WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id.get() as i64], read_row)
            .optional()?)
    }

    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let now = to_ms(self.clock.now());
        let conn = self.conn.lock().await;
        let mut counts = OutboxCounts::default();
        {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for entry in rows {
                let (status, n) = entry?;
                let n = n as usize;
                match OutboxStatus::parse(&status) {
                    Some(OutboxStatus::Pending) => counts.pending = n,
                    Some(OutboxStatus::Published) => counts.published = n,
                    Some(OutboxStatus::Dead) => counts.dead = n,
                    None => warn!(status = %status, rows = n, "unknown outbox status in table"),
                }
            }
        }
        let leased: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE status = 'pending' AND locked_until >= ?1",
            params![now],
            |row| row.get(0),
        )?;
        counts.leased = leased as usize;
        Ok(counts)
    }
}
