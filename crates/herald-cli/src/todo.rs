//! A tiny todo service: the business write that rides along with the outbox.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::impls::{InMemoryOutboxStore, MemoryTx, SqliteOutboxStore, SqliteTx};
use herald_core::ports::{OutboxStore, Transaction};
use herald_core::{Event, Headers, OutboxWriter};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TodoItem {
    pub fn new(description: impl Into<String>, due_date: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new().to_string(),
            description: description.into(),
            due_date,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Payload of `todo.created`. Field names are what stream consumers read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoCreated {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TodoItem> for TodoCreated {
    fn from(item: &TodoItem) -> Self {
        Self {
            id: item.id.clone(),
            description: item.description.clone(),
            due_date: item.due_date,
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}

impl Event for TodoCreated {
    const EVENT_TYPE: &'static str = "todo.created";
    const AGGREGATE_TYPE: &'static str = "todo";

    fn aggregate_id(&self) -> String {
        self.id.clone()
    }
}

/// Where todos live, for each outbox backend.
#[async_trait]
pub trait TodoTable: OutboxStore {
    async fn ensure_schema(&self) -> anyhow::Result<()>;

    /// Stage the todo row in `tx`.
    fn put_todo(tx: &mut Self::Tx, item: &TodoItem) -> anyhow::Result<()>;
}

#[async_trait]
impl TodoTable for InMemoryOutboxStore {
    async fn ensure_schema(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn put_todo(tx: &mut MemoryTx, item: &TodoItem) -> anyhow::Result<()> {
        tx.put_record("todos", item.id.clone(), serde_json::to_value(item)?);
        Ok(())
    }
}

#[async_trait]
impl TodoTable for SqliteOutboxStore {
    async fn ensure_schema(&self) -> anyhow::Result<()> {
        self.migrate(
            "CREATE TABLE IF NOT EXISTS todos (
                id          TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                due_date    TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );",
        )
        .await?;
        Ok(())
    }

    fn put_todo(tx: &mut SqliteTx, item: &TodoItem) -> anyhow::Result<()> {
        tx.connection().execute(
            "INSERT INTO todos (id, description, due_date, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                item.id,
                item.description,
                item.due_date.map(|d| d.to_rfc3339()),
                item.created_at.to_rfc3339(),
                item.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

pub struct TodoService<S: TodoTable> {
    store: Arc<S>,
    writer: OutboxWriter<S>,
}

impl<S: TodoTable> TodoService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            writer: OutboxWriter::new(Arc::clone(&store)),
            store,
        }
    }

    /// Insert the todo and its `todo.created` event in one transaction.
    pub async fn create(
        &self,
        description: impl Into<String>,
        due_date: Option<DateTime<Utc>>,
    ) -> anyhow::Result<TodoItem> {
        let item = TodoItem::new(description, due_date);
        let mut tx = self.store.begin().await?;
        S::put_todo(&mut tx, &item)?;
        self.writer
            .write(
                &mut tx,
                &TodoCreated::from(&item),
                Headers::new()
                    .with(Headers::SOURCE, "api")
                    .with(Headers::SCHEMA, "v1"),
            )
            .await?;
        // an early return above drops tx, which rolls back both writes
        tx.commit().await?;
        Ok(item)
    }
}
