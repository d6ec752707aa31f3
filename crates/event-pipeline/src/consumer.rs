//! Consumer side of the pipeline: deliver, or dead-letter and move on.
//!
//! Every message read from the source queue ends in exactly one
//! acknowledgment:
//!
//! ```text
//! RECEIVED --decode fails------------------------> ack (discarded)
//! RECEIVED --deliver ok--------------------------> ack
//! RECEIVED --deliver fails--> DLQ(retry + 1) ----> ack
//! RECEIVED --deliver fails, retries exhausted----> ack (logged)
//! ```
//!
//! A failing delivery callback never stops the consumer. An acknowledgment
//! that keeps failing is remembered and settled before the next read, so a
//! broker outage between delivery and ack does not strand the message in the
//! pending list.

use crate::broker::QueueBroker;
use crate::error::PipelineResult;
use crate::message::Delivery;
use crate::publisher::EventPublisher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Metadata about the message being delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub queue: String,
    pub message_id: String,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// The side effect performed for each message.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    type Event: DeserializeOwned + Send;

    async fn deliver(&self, event: Self::Event, ctx: &DeliveryContext) -> anyhow::Result<()>;
}

/// How many times a message may be dead-lettered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` dead-letters every failure. `Some(n)` stops once a dead letter
    /// would carry a retry count above `n`.
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_retries: None }
    }

    pub fn limited(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
        }
    }

    /// Whether a dead letter with `next_retry_count` may be produced.
    pub fn allows(&self, next_retry_count: u32) -> bool {
        self.max_retries.map_or(true, |max| next_retry_count <= max)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub source_queue: String,
    pub dead_letter_queue: String,
    pub consumer_name: String,
    /// How long one read waits for a message.
    pub block_timeout: Duration,
    pub retry: RetryPolicy,
    /// Attempts at publishing one dead letter before giving up on it.
    pub dead_letter_attempts: u32,
    /// Attempts at one acknowledgment before it is deferred to the next read.
    pub ack_attempts: u32,
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,
}

impl ConsumerConfig {
    pub fn new(source_queue: impl Into<String>, dead_letter_queue: impl Into<String>) -> Self {
        Self {
            source_queue: source_queue.into(),
            dead_letter_queue: dead_letter_queue.into(),
            consumer_name: format!("consumer-{}", uuid::Uuid::new_v4().simple()),
            block_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            dead_letter_attempts: 3,
            ack_attempts: 3,
            error_backoff_base: Duration::from_millis(100),
            error_backoff_max: Duration::from_secs(30),
        }
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What happened to one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Nothing arrived within the block timeout.
    Idle,
    Delivered,
    /// The callback failed; a copy went to the dead-letter queue.
    DeadLettered { retry_count: u32 },
    /// The body did not decode; acknowledged without retry.
    Discarded,
    /// The callback failed and the retry policy forbids another dead letter.
    Exhausted { retry_count: u32 },
    /// The callback failed and the dead letter could not be published.
    DeadLetterFailed { retry_count: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
    pub exhausted: u64,
    pub dead_letter_failures: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
    dead_letter_failures: AtomicU64,
}

/// Pulls messages from one queue and runs them through a handler.
pub struct EventConsumer<H: DeliveryHandler> {
    broker: Arc<dyn QueueBroker>,
    publisher: EventPublisher,
    handler: H,
    config: ConsumerConfig,
    counters: Counters,
    /// Message ids handled but not yet acknowledged.
    owed_acks: Mutex<Vec<String>>,
}

impl<H: DeliveryHandler> EventConsumer<H> {
    pub fn new(broker: Arc<dyn QueueBroker>, handler: H, config: ConsumerConfig) -> Self {
        Self {
            publisher: EventPublisher::new(broker.clone()),
            broker,
            handler,
            config,
            counters: Counters::default(),
            owed_acks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            dead_letter_failures: self.counters.dead_letter_failures.load(Ordering::Relaxed),
        }
    }

    /// Acknowledgments still owed to the broker.
    pub fn owed_acks(&self) -> usize {
        self.owed_acks.lock().len()
    }

    /// Read one message (waiting up to the block timeout) and process it.
    ///
    /// Owed acknowledgments are settled first; if that fails nothing is read.
    pub async fn process_one(&self) -> PipelineResult<ConsumeOutcome> {
        self.settle_owed().await?;
        match self.read().await? {
            Some(delivery) => self.handle(delivery).await,
            None => Ok(ConsumeOutcome::Idle),
        }
    }

    async fn read(&self) -> PipelineResult<Option<Delivery>> {
        self.broker
            .read_next(
                &self.config.source_queue,
                &self.config.consumer_name,
                self.config.block_timeout,
            )
            .await
    }

    /// Process a message that has already been read from the source queue.
    pub async fn handle(&self, delivery: Delivery) -> PipelineResult<ConsumeOutcome> {
        let ctx = DeliveryContext {
            queue: self.config.source_queue.clone(),
            message_id: delivery.message_id.clone(),
            retry_count: delivery.message.retry_count,
            enqueued_at: delivery.message.enqueued_at,
        };

        let event: H::Event = match delivery.message.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    queue = %ctx.queue,
                    message_id = %ctx.message_id,
                    error = %e,
                    "discarding undecodable message"
                );
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                self.settle(&ctx).await?;
                return Ok(ConsumeOutcome::Discarded);
            }
        };

        let failure = match self.handler.deliver(event, &ctx).await {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %ctx.queue, message_id = %ctx.message_id, "delivered");
                self.settle(&ctx).await?;
                return Ok(ConsumeOutcome::Delivered);
            }
            Err(e) => e,
        };

        let next_retry = ctx.retry_count.saturating_add(1);

        if !self.config.retry.allows(next_retry) {
            error!(
                queue = %ctx.queue,
                message_id = %ctx.message_id,
                retry_count = ctx.retry_count,
                error = %failure,
                "delivery failed and retries are exhausted, dropping message"
            );
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            self.settle(&ctx).await?;
            return Ok(ConsumeOutcome::Exhausted {
                retry_count: ctx.retry_count,
            });
        }

        warn!(
            queue = %ctx.queue,
            message_id = %ctx.message_id,
            retry_count = next_retry,
            dead_letter_queue = %self.config.dead_letter_queue,
            error = %failure,
            "delivery failed, dead-lettering"
        );

        let published = self.dead_letter(&ctx, delivery.message.body, next_retry).await;
        let outcome = if published {
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            ConsumeOutcome::DeadLettered {
                retry_count: next_retry,
            }
        } else {
            self.counters.dead_letter_failures.fetch_add(1, Ordering::Relaxed);
            ConsumeOutcome::DeadLetterFailed {
                retry_count: next_retry,
            }
        };
        self.settle(&ctx).await?;
        Ok(outcome)
    }

    /// Publish the dead letter, retrying a few times. The original is
    /// acknowledged either way.
    async fn dead_letter(&self, ctx: &DeliveryContext, body: Vec<u8>, retry_count: u32) -> bool {
        let attempts = self.config.dead_letter_attempts.max(1);
        let mut delay = self.config.error_backoff_base;

        for attempt in 1..=attempts {
            match self
                .publisher
                .republish(&self.config.dead_letter_queue, body.clone(), retry_count)
                .await
            {
                Ok(dead_letter_id) => {
                    debug!(
                        message_id = %ctx.message_id,
                        dead_letter_id = %dead_letter_id,
                        retry_count,
                        "dead letter published"
                    );
                    return true;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        message_id = %ctx.message_id,
                        attempt,
                        error = %e,
                        "dead letter publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.config.error_backoff_max);
                }
                Err(e) => {
                    error!(
                        queue = %ctx.queue,
                        message_id = %ctx.message_id,
                        dead_letter_queue = %self.config.dead_letter_queue,
                        attempts,
                        error = %e,
                        "failed to publish dead letter, message lost"
                    );
                }
            }
        }
        false
    }

    /// Acknowledge a handled message, retrying transport failures. When every
    /// attempt fails the id is kept in `owed_acks` and the error returned.
    async fn settle(&self, ctx: &DeliveryContext) -> PipelineResult<()> {
        let attempts = self.config.ack_attempts.max(1);
        let mut delay = self.config.error_backoff_base;
        let mut attempt = 1;

        loop {
            match self.broker.ack(&ctx.queue, &ctx.message_id).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() && attempt < attempts => {
                    warn!(
                        queue = %ctx.queue,
                        message_id = %ctx.message_id,
                        attempt,
                        error = %e,
                        "ack failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.config.error_backoff_max);
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        queue = %ctx.queue,
                        message_id = %ctx.message_id,
                        attempts = attempt,
                        error = %e,
                        "ack failed, deferring until the broker recovers"
                    );
                    self.owed_acks.lock().push(ctx.message_id.clone());
                    return Err(e);
                }
            }
        }
    }

    /// Acknowledge everything left over from earlier failures, oldest first.
    /// Ids that still cannot be acknowledged stay owed.
    async fn settle_owed(&self) -> PipelineResult<()> {
        let owed = std::mem::take(&mut *self.owed_acks.lock());
        if owed.is_empty() {
            return Ok(());
        }

        let mut remaining = owed.into_iter();
        while let Some(message_id) = remaining.next() {
            if let Err(e) = self.broker.ack(&self.config.source_queue, &message_id).await {
                let mut owed_acks = self.owed_acks.lock();
                let newer = std::mem::take(&mut *owed_acks);
                owed_acks.push(message_id);
                owed_acks.extend(remaining);
                owed_acks.extend(newer);
                return Err(e);
            }
            info!(
                queue = %self.config.source_queue,
                message_id = %message_id,
                "deferred ack settled"
            );
        }
        Ok(())
    }

    /// Consume until `cancel` fires. Broker errors are logged and retried
    /// with capped exponential backoff; transport errors also reconnect.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            queue = %self.config.source_queue,
            dead_letter_queue = %self.config.dead_letter_queue,
            consumer = %self.config.consumer_name,
            "consumer started"
        );

        let mut backoff = self.config.error_backoff_base;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Only the wait for a message is cancellable; owed acks and a
            // message in hand are always finished.
            let result = match self.settle_owed().await {
                Ok(()) => {
                    let read = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        read = self.read() => read,
                    };
                    match read {
                        Ok(Some(delivery)) => self.handle(delivery).await.map(Some),
                        Ok(None) => Ok(None),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(_) => backoff = self.config.error_backoff_base,
                Err(e) => {
                    error!(
                        queue = %self.config.source_queue,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "consumer broker error"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, self.config.error_backoff_max);

                    if e.is_transport() {
                        self.reconnect().await;
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            queue = %self.config.source_queue,
            delivered = stats.delivered,
            dead_lettered = stats.dead_lettered,
            discarded = stats.discarded,
            exhausted = stats.exhausted,
            owed_acks = self.owed_acks(),
            "consumer stopped"
        );
    }

    async fn reconnect(&self) {
        if let Err(e) = self.broker.reconnect().await {
            warn!(queue = %self.config.source_queue, error = %e, "reconnect failed");
        }
    }
}
