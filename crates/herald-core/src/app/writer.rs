//! OutboxWriter - the write side, used inside business transactions.
//!
//! ```ignore
//! let mut tx = store.begin().await?;
//! // business write on the same tx ...
//! writer.write(&mut tx, &TodoCreated { .. }, Headers::new()).await?;
//! tx.commit().await?;
//! ```
//!
//! On any error the caller must drop or roll back `tx`; committing after a
//! failed write would persist the business change without its event.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{Headers, OutboxMessage, WriteError};
use crate::ports::OutboxStore;
use crate::typed::Event;

pub struct OutboxWriter<S: OutboxStore> {
    store: Arc<S>,
}

impl<S: OutboxStore> Clone for OutboxWriter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: OutboxStore> OutboxWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Serialize `event` as JSON and stage it in `tx`.
    pub async fn write<E: Event>(
        &self,
        tx: &mut S::Tx,
        event: &E,
        headers: Headers,
    ) -> Result<(), WriteError> {
        let message =
            OutboxMessage::json(event.aggregate(), E::EVENT_TYPE, event)?.with_headers(headers);
        self.write_message(tx, message).await
    }

    pub async fn write_message(
        &self,
        tx: &mut S::Tx,
        message: OutboxMessage,
    ) -> Result<(), WriteError> {
        debug!(
            event_type = %message.event_type,
            aggregate_type = %message.aggregate.aggregate_type,
            aggregate_id = %message.aggregate.aggregate_id,
            "staging outbox event"
        );
        self.store.insert(tx, message).await?;
        Ok(())
    }
}
