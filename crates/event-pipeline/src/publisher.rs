//! Producer side of the pipeline.

use crate::broker::QueueBroker;
use crate::error::PipelineResult;
use crate::message::QueuedMessage;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Serializes events and hands them to the broker.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn QueueBroker>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    /// Publish `event` as JSON onto `queue` with retry count 0. Returns the
    /// broker message id; broker failures surface here.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        event: &T,
    ) -> PipelineResult<String> {
        let body = serde_json::to_vec(event)?;
        let message_id = self.broker.enqueue(&QueuedMessage::new(queue, body)).await?;
        debug!(queue, message_id = %message_id, "published");
        Ok(message_id)
    }

    /// Forward an already-serialized body with explicit retry metadata.
    pub async fn republish(
        &self,
        queue: &str,
        body: Vec<u8>,
        retry_count: u32,
    ) -> PipelineResult<String> {
        let message = QueuedMessage::new(queue, body).with_retry_count(retry_count);
        self.broker.enqueue(&message).await
    }
}
