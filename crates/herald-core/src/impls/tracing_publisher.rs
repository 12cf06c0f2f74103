//! Publisher that only logs. Handy for local runs without a broker.

use async_trait::async_trait;
use tracing::info;

use crate::domain::{PublishError, StreamEvent};
use crate::ports::StreamPublisher;

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl StreamPublisher for TracingPublisher {
    async fn publish(&self, event: &StreamEvent) -> Result<(), PublishError> {
        info!(
            stream = %event.stream,
            key = %event.key,
            outbox_id = %event.outbox_id,
            event_type = %event.event_type,
            payload = event.payload_str().unwrap_or("<binary>"),
            "published event"
        );
        Ok(())
    }
}
