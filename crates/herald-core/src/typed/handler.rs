//! Event handlers.
//!
//! Two layers:
//! - `EventHandler<E>`: typed surface, receives the decoded event.
//! - `DynHandler`: object-safe, works on raw `ClaimedRow`s so the registry
//!   can hold handlers for different event types in one map.
//!
//! `TypedHandler<E, H>` bridges the two and owns payload decoding.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::event::Event;
use crate::domain::{AggregateRef, ClaimedRow, Headers, HandlerError, OutboxId, StreamEvent};
use crate::ports::StreamPublisher;

/// Row metadata passed alongside a decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub outbox_id: OutboxId,
    pub aggregate: AggregateRef,
    pub event_type: String,
    pub headers: Headers,
    /// Failed attempts before this one.
    pub attempts: u32,
    /// Payload as stored, byte for byte.
    pub payload: Vec<u8>,
}

impl From<&ClaimedRow> for EventContext {
    fn from(row: &ClaimedRow) -> Self {
        Self {
            outbox_id: row.id,
            aggregate: AggregateRef::new(&row.aggregate_type, &row.aggregate_id),
            event_type: row.event_type.clone(),
            headers: row.headers.clone(),
            attempts: row.attempts,
            payload: row.payload.clone(),
        }
    }
}

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: E, ctx: &EventContext) -> Result<(), HandlerError>;

    /// Whether `handle_batch` does better than one `handle` per event.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Handle several events as one unit: either all succeed or the whole
    /// batch is reported as failed.
    async fn handle_batch(&self, items: Vec<(E, EventContext)>) -> Result<(), HandlerError> {
        for (event, ctx) in items {
            self.handle(event, &ctx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<E: Event, H: EventHandler<E> + ?Sized> EventHandler<E> for Arc<H> {
    async fn handle(&self, event: E, ctx: &EventContext) -> Result<(), HandlerError> {
        (**self).handle(event, ctx).await
    }

    fn supports_batch(&self) -> bool {
        (**self).supports_batch()
    }

    async fn handle_batch(&self, items: Vec<(E, EventContext)>) -> Result<(), HandlerError> {
        (**self).handle_batch(items).await
    }
}

#[async_trait]
pub trait DynHandler: Send + Sync {
    fn event_type(&self) -> &str;

    async fn handle_row(&self, row: &ClaimedRow) -> Result<(), HandlerError>;

    fn supports_batch(&self) -> bool {
        false
    }

    /// One result per row, in order.
    async fn handle_rows(&self, rows: &[ClaimedRow]) -> Vec<Result<(), HandlerError>> {
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(self.handle_row(row).await);
        }
        results
    }
}

pub struct TypedHandler<E: Event, H: EventHandler<E>> {
    handler: H,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Event, H: EventHandler<E>> TypedHandler<E, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

fn decode<E: Event>(row: &ClaimedRow) -> Result<E, HandlerError> {
    serde_json::from_slice(&row.payload).map_err(HandlerError::Decode)
}

/// Copy of a batch-level error for every row that took part in the batch.
fn share_error(err: &HandlerError) -> HandlerError {
    if err.is_permanent() {
        HandlerError::Permanent(err.to_string())
    } else {
        HandlerError::Transient(err.to_string())
    }
}

#[async_trait]
impl<E: Event, H: EventHandler<E>> DynHandler for TypedHandler<E, H> {
    fn event_type(&self) -> &str {
        E::EVENT_TYPE
    }

    async fn handle_row(&self, row: &ClaimedRow) -> Result<(), HandlerError> {
        let event = decode::<E>(row)?;
        self.handler.handle(event, &EventContext::from(row)).await
    }

    fn supports_batch(&self) -> bool {
        self.handler.supports_batch()
    }

    async fn handle_rows(&self, rows: &[ClaimedRow]) -> Vec<Result<(), HandlerError>> {
        // Rows whose payload does not decode fail on their own; the rest go
        // out together.
        let mut results: Vec<Option<Result<(), HandlerError>>> = Vec::with_capacity(rows.len());
        let mut batch = Vec::new();
        let mut members = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            match decode::<E>(row) {
                Ok(event) => {
                    batch.push((event, EventContext::from(row)));
                    members.push(i);
                    results.push(None);
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }

        if !batch.is_empty() {
            let outcome = self.handler.handle_batch(batch).await;
            for i in members {
                results[i] = Some(match &outcome {
                    Ok(()) => Ok(()),
                    Err(e) => Err(share_error(e)),
                });
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(HandlerError::Transient("row skipped".into()))))
            .collect()
    }
}

/// Stock handler: forwards the stored payload to a stream publisher.
///
/// The payload is decoded first so malformed rows are dead-lettered rather
/// than pushed downstream, but the bytes sent are the stored ones.
pub struct PublishHandler<E, P: ?Sized> {
    publisher: Arc<P>,
    stream: String,
    _marker: PhantomData<fn() -> E>,
}

impl<E, P: ?Sized> PublishHandler<E, P> {
    pub fn new(publisher: Arc<P>, stream: impl Into<String>) -> Self {
        Self {
            publisher,
            stream: stream.into(),
            _marker: PhantomData,
        }
    }

    pub fn stream_event(&self, ctx: &EventContext) -> StreamEvent {
        StreamEvent {
            stream: self.stream.clone(),
            key: ctx.aggregate.aggregate_id.clone(),
            outbox_id: ctx.outbox_id,
            event_type: ctx.event_type.clone(),
            aggregate_type: ctx.aggregate.aggregate_type.clone(),
            payload: ctx.payload.clone(),
            headers: ctx.headers.clone(),
        }
    }
}

#[async_trait]
impl<E, P> EventHandler<E> for PublishHandler<E, P>
where
    E: Event,
    P: StreamPublisher + ?Sized,
{
    async fn handle(&self, _event: E, ctx: &EventContext) -> Result<(), HandlerError> {
        self.publisher.publish(&self.stream_event(ctx)).await?;
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        self.publisher.supports_bulk()
    }

    async fn handle_batch(&self, items: Vec<(E, EventContext)>) -> Result<(), HandlerError> {
        let events: Vec<StreamEvent> = items
            .iter()
            .map(|(_, ctx)| self.stream_event(ctx))
            .collect();
        self.publisher.publish_batch(&events).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, Lease, LeaseToken};
    use crate::impls::InMemoryStreamPublisher;
    use crate::typed::event::fixtures::ItemCreated;
    use chrono::Utc;
    use ulid::Ulid;

    fn row(id: u64, payload: &str) -> ClaimedRow {
        ClaimedRow {
            id: OutboxId::new(id),
            aggregate_type: "item".into(),
            aggregate_id: format!("i-{id}"),
            event_type: ItemCreated::EVENT_TYPE.into(),
            payload: payload.as_bytes().to_vec(),
            headers: Headers::new().with(Headers::SCHEMA, "v1"),
            attempts: 2,
            lease: Lease {
                token: LeaseToken::from_ulid(Ulid::new()),
                locked_until: Utc::now(),
            },
        }
    }

    struct Recording(tokio::sync::Mutex<Vec<(ItemCreated, EventContext)>>);

    #[async_trait]
    impl EventHandler<ItemCreated> for Recording {
        async fn handle(&self, event: ItemCreated, ctx: &EventContext) -> Result<(), HandlerError> {
            self.0.lock().await.push((event, ctx.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_passes_context() {
        let recording = Arc::new(Recording(Default::default()));
        let handler = TypedHandler::<ItemCreated, _>::new(Arc::clone(&recording));

        handler
            .handle_row(&row(3, r#"{"id":"i-3","name":"lamp"}"#))
            .await
            .unwrap();

        let seen = recording.0.lock().await;
        let (event, ctx) = &seen[0];
        assert_eq!(event.name, "lamp");
        assert_eq!(ctx.outbox_id, OutboxId::new(3));
        assert_eq!(ctx.attempts, 2);
        assert_eq!(ctx.headers.schema_version(), Some("v1"));
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let handler = TypedHandler::<ItemCreated, _>::new(Recording(Default::default()));
        let err = handler.handle_row(&row(1, "{broken")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn publish_handler_forwards_stored_bytes() {
        let publisher = Arc::new(InMemoryStreamPublisher::new());
        let handler = TypedHandler::<ItemCreated, _>::new(PublishHandler::new(
            Arc::clone(&publisher),
            "items",
        ));
        let payload = r#"{"name":"lamp","id":"i-1"}"#;

        handler.handle_row(&row(1, payload)).await.unwrap();

        let published = publisher.published().await;
        assert_eq!(published[0].stream, "items");
        assert_eq!(published[0].key, "i-1");
        assert_eq!(published[0].payload, payload.as_bytes());
    }

    #[tokio::test]
    async fn batch_isolates_bad_rows_and_shares_publish_failure() {
        let publisher = Arc::new(InMemoryStreamPublisher::new());
        let handler = TypedHandler::<ItemCreated, _>::new(PublishHandler::new(
            Arc::clone(&publisher),
            "items",
        ));
        assert!(handler.supports_batch());

        let rows = vec![
            row(1, r#"{"id":"i-1","name":"a"}"#),
            row(2, "nope"),
            row(3, r#"{"id":"i-3","name":"c"}"#),
        ];
        let results = handler.handle_rows(&rows).await;
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_permanent());
        assert!(results[2].is_ok());
        assert_eq!(publisher.published().await.len(), 2);

        publisher.fail_next(1).await;
        let results = handler.handle_rows(&rows).await;
        assert!(matches!(results[0], Err(HandlerError::Transient(_))));
        assert!(matches!(results[2], Err(HandlerError::Transient(_))));
        assert_eq!(publisher.published().await.len(), 2);
    }
}
