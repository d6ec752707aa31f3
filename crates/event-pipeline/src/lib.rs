//! Event pipeline: publish, queue, consume, retry and dead-letter.
//!
//! Producers hand JSON events to an [`EventPublisher`]. An [`EventConsumer`]
//! reads them one at a time and runs a [`DeliveryHandler`]. A failed
//! delivery is copied to a dead-letter queue with its retry count bumped by
//! one, and the original is acknowledged so the source queue keeps draining.
//!
//! # Core Invariants
//!
//! 1. **One ack per message**: every message read is acknowledged exactly
//!    once, on every path. An ack the broker refuses is retried, then kept
//!    and settled before the consumer reads again; Redis readers also pick
//!    up entries left pending by a crash.
//! 2. **Counted retries**: a message failing N times yields N dead letters
//!    with retry counts 1, 2, ..., N.
//! 3. **Failures never stop the consumer**: callback errors, malformed
//!    bodies and broker outages are logged and survived.
//!
//! # Architecture
//!
//! ```text
//! producer -> publisher -> email.queue -> consumer -> handler
//!                                            |  (fails)
//!                                            v
//!                           email.dlq (x-retry-count + 1)
//!                                            |
//!                                     redriver (operator)
//!                                            v
//!                                       email.queue
//! ```

pub mod broker;
pub mod consumer;
pub mod error;
pub mod jobs;
pub mod message;
pub mod publisher;
pub mod redis_queue;
pub mod redrive;

#[cfg(test)]
mod tests;

pub use broker::{MemoryQueue, QueueBroker};
pub use consumer::{
    ConsumeOutcome, ConsumerConfig, ConsumerStats, DeliveryContext, DeliveryHandler,
    EventConsumer, RetryPolicy,
};
pub use error::{PipelineError, PipelineResult};
pub use jobs::{
    EmailJob, EmailMessage, ExportFormat, ExportJob, NotificationEvent, EMAIL_DLQ, EMAIL_QUEUE,
    EXPORT_DLQ, EXPORT_QUEUE,
};
pub use message::{Delivery, QueuedMessage, RETRY_COUNT_HEADER};
pub use publisher::EventPublisher;
pub use redis_queue::{RedisQueue, DEFAULT_CLAIM_IDLE, DEFAULT_CONSUMER_GROUP};
pub use redrive::DeadLetterRedriver;
