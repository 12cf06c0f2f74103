//! In-memory stream publisher.
//!
//! Records every delivered event. Failures can be injected so tests can
//! drive the retry path without a real broker.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{OutboxId, PublishError, StreamEvent};
use crate::ports::StreamPublisher;

#[derive(Default)]
struct PublisherState {
    published: Vec<StreamEvent>,
    fail_next: usize,
    rejected_types: HashSet<String>,
    attempts: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryStreamPublisher {
    state: Arc<Mutex<PublisherState>>,
}

impl InMemoryStreamPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls with `PublishError::Unavailable`.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.fail_next = n;
    }

    /// Reject every event of this type until cleared.
    pub async fn reject_type(&self, event_type: impl Into<String>) {
        self.state.lock().await.rejected_types.insert(event_type.into());
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.fail_next = 0;
        state.rejected_types.clear();
    }

    /// Successfully published events, in delivery order (duplicates kept).
    pub async fn published(&self) -> Vec<StreamEvent> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_ids(&self) -> Vec<OutboxId> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .map(|e| e.outbox_id)
            .collect()
    }

    /// Publish calls seen, successful or not.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }
}

impl PublisherState {
    fn check(&mut self, event: &StreamEvent) -> Result<(), PublishError> {
        self.attempts += 1;
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(PublishError::Unavailable("injected failure".into()));
        }
        if self.rejected_types.contains(&event.event_type) {
            return Err(PublishError::Rejected(format!(
                "event type '{}' rejected",
                event.event_type
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamPublisher for InMemoryStreamPublisher {
    async fn publish(&self, event: &StreamEvent) -> Result<(), PublishError> {
        let mut state = self.state.lock().await;
        state.check(event)?;
        state.published.push(event.clone());
        Ok(())
    }

    fn supports_bulk(&self) -> bool {
        true
    }

    /// All or nothing: the batch is appended only if every event passes.
    async fn publish_batch(&self, events: &[StreamEvent]) -> Result<(), PublishError> {
        let mut state = self.state.lock().await;
        for event in events {
            state.check(event)?;
        }
        state.published.extend_from_slice(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Headers;

    fn event(id: u64) -> StreamEvent {
        StreamEvent {
            stream: "todo-events".into(),
            key: format!("t-{id}"),
            outbox_id: OutboxId::new(id),
            event_type: "todo.created".into(),
            aggregate_type: "todo".into(),
            payload: b"{}".to_vec(),
            headers: Headers::new(),
        }
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let publisher = InMemoryStreamPublisher::new();
        publisher.fail_next(2).await;

        assert!(publisher.publish(&event(1)).await.is_err());
        assert!(publisher.publish(&event(1)).await.is_err());
        publisher.publish(&event(1)).await.unwrap();

        assert_eq!(publisher.attempts().await, 3);
        assert_eq!(publisher.published_ids().await, vec![OutboxId::new(1)]);
    }

    #[tokio::test]
    async fn failed_batch_publishes_nothing() {
        let publisher = InMemoryStreamPublisher::new();
        publisher.reject_type("todo.created").await;

        let err = publisher
            .publish_batch(&[event(1), event(2)])
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Rejected(_)));
        assert!(publisher.published().await.is_empty());

        publisher.clear_failures().await;
        publisher.publish_batch(&[event(1), event(2)]).await.unwrap();
        assert_eq!(publisher.published().await.len(), 2);
    }
}
