//! Moving dead letters back onto a work queue.

use crate::broker::QueueBroker;
use crate::error::PipelineResult;
use crate::publisher::EventPublisher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Operator tool that drains a dead-letter queue into a target queue.
///
/// Bodies are forwarded unchanged and keep their retry count, so a message
/// that fails again lands in the dead-letter queue one count higher.
pub struct DeadLetterRedriver {
    broker: Arc<dyn QueueBroker>,
    publisher: EventPublisher,
    consumer_name: String,
}

impl DeadLetterRedriver {
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self {
            publisher: EventPublisher::new(broker.clone()),
            broker,
            consumer_name: "redriver".to_string(),
        }
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    /// Move up to `limit` messages from `from` to `to`. Stops early when
    /// `from` is empty. Returns how many were moved.
    pub async fn redrive(&self, from: &str, to: &str, limit: usize) -> PipelineResult<usize> {
        let mut moved = 0;

        while moved < limit {
            let Some(delivery) = self
                .broker
                .read_next(from, &self.consumer_name, Duration::ZERO)
                .await?
            else {
                break;
            };

            let retry_count = delivery.message.retry_count;
            let new_id = self
                .publisher
                .republish(to, delivery.message.body, retry_count)
                .await?;
            self.broker.ack(from, &delivery.message_id).await?;

            debug!(
                from,
                to,
                message_id = %delivery.message_id,
                new_id = %new_id,
                retry_count,
                "redrove dead letter"
            );
            moved += 1;
        }

        info!(from, to, moved, "redrive finished");
        Ok(moved)
    }
}
