//! Test harness for event pipeline tests.
//!
//! Provides:
//! - ScriptedHandler: a delivery handler whose outcomes are scripted
//! - TestPipeline: an in-memory broker with a publisher and consumer factory

use crate::broker::MemoryQueue;
use crate::consumer::{ConsumerConfig, DeliveryContext, DeliveryHandler, EventConsumer, RetryPolicy};
use crate::jobs::{EMAIL_DLQ, EMAIL_QUEUE};
use crate::publisher::EventPublisher;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the handler answers a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
}

/// A delivery the handler saw.
#[derive(Debug, Clone)]
pub struct SeenDelivery {
    pub event: Value,
    pub ctx: DeliveryContext,
}

/// Handler that records every delivery and answers from a script.
#[derive(Clone)]
pub struct ScriptedHandler {
    seen: Arc<Mutex<Vec<SeenDelivery>>>,
    script: Arc<Mutex<VecDeque<Outcome>>>,
    default: Outcome,
}

impl ScriptedHandler {
    pub fn always(outcome: Outcome) -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            default: outcome,
        }
    }

    /// Answer with `script` first, then `then` forever.
    pub fn scripted(script: Vec<Outcome>, then: Outcome) -> Self {
        let handler = Self::always(then);
        handler.script.lock().unwrap().extend(script);
        handler
    }

    pub fn seen(&self) -> Vec<SeenDelivery> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryHandler for ScriptedHandler {
    type Event = Value;

    async fn deliver(&self, event: Value, ctx: &DeliveryContext) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(SeenDelivery {
            event,
            ctx: ctx.clone(),
        });
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(self.default);
        match outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail => anyhow::bail!("smtp relay refused connection"),
        }
    }
}

/// In-memory broker with helpers for building consumers.
pub struct TestPipeline {
    pub broker: Arc<MemoryQueue>,
    pub publisher: EventPublisher,
}

impl TestPipeline {
    pub fn new() -> Self {
        let broker = Arc::new(MemoryQueue::new());
        Self {
            publisher: EventPublisher::new(broker.clone()),
            broker,
        }
    }

    pub fn config(&self, source: &str, dead_letter: &str, retry: RetryPolicy) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(source, dead_letter)
            .with_consumer_name("test")
            .with_block_timeout(Duration::ZERO)
            .with_retry(retry);
        config.error_backoff_base = Duration::from_millis(5);
        config.error_backoff_max = Duration::from_millis(20);
        config
    }

    /// Consumer on `email.queue` dead-lettering to `email.dlq`.
    pub fn email_consumer(
        &self,
        handler: ScriptedHandler,
        retry: RetryPolicy,
    ) -> EventConsumer<ScriptedHandler> {
        EventConsumer::new(
            self.broker.clone(),
            handler,
            self.config(EMAIL_QUEUE, EMAIL_DLQ, retry),
        )
    }
}

/// Poll `condition` every few milliseconds until it holds or `within`
/// elapses.
pub async fn wait_until(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
