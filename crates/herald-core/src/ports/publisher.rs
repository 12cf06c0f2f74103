//! StreamPublisher port - delivery to the external stream / broker.
//!
//! Any `Err` is a delivery failure and the row will be retried, so an
//! implementation must tolerate being called again with the same event.
//! Connection management is the publisher's own business.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{PublishError, StreamEvent};

#[async_trait]
pub trait StreamPublisher: Send + Sync {
    async fn publish(&self, event: &StreamEvent) -> Result<(), PublishError>;

    /// Whether `publish_batch` is a native bulk operation (one round trip)
    /// rather than the sequential fallback.
    fn supports_bulk(&self) -> bool {
        false
    }

    /// Publish several events. The fallback stops at the first failure;
    /// events before it may already be delivered.
    async fn publish_batch(&self, events: &[StreamEvent]) -> Result<(), PublishError> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<P: StreamPublisher + ?Sized> StreamPublisher for Arc<P> {
    async fn publish(&self, event: &StreamEvent) -> Result<(), PublishError> {
        (**self).publish(event).await
    }

    fn supports_bulk(&self) -> bool {
        (**self).supports_bulk()
    }

    async fn publish_batch(&self, events: &[StreamEvent]) -> Result<(), PublishError> {
        (**self).publish_batch(events).await
    }
}
