//! Queue broker abstraction.
//!
//! A broker stores messages per named queue and hands each one to a single
//! consumer at a time. A message read but not yet acknowledged stays
//! pending; acknowledging removes it for good.

use crate::error::{PipelineError, PipelineResult};
use crate::message::{Delivery, QueuedMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// A durable, named-queue message broker.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Append `message` to `message.queue`. Returns the broker's message id.
    async fn enqueue(&self, message: &QueuedMessage) -> PipelineResult<String>;

    /// Take the next unread message on `queue` for `consumer`, waiting up to
    /// `block` for one to arrive. A zero `block` never waits.
    async fn read_next(
        &self,
        queue: &str,
        consumer: &str,
        block: Duration,
    ) -> PipelineResult<Option<Delivery>>;

    /// Acknowledge and discard a delivered message.
    async fn ack(&self, queue: &str, message_id: &str) -> PipelineResult<()>;

    /// Messages on `queue` that have not been acknowledged.
    async fn depth(&self, queue: &str) -> PipelineResult<usize>;

    /// Re-establish the broker connection after a transport error.
    async fn reconnect(&self) -> PipelineResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(String, QueuedMessage)>,
    pending: HashMap<String, (String, QueuedMessage)>,
    acked: Vec<String>,
}

/// In-process broker for single-instance deployments and tests.
///
/// Messages live as long as the process. Supports fault injection through
/// [`set_available`](Self::set_available),
/// [`fail_enqueues`](Self::fail_enqueues) and [`fail_acks`](Self::fail_acks).
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    arrivals: Notify,
    next_id: AtomicU64,
    available: AtomicBool,
    enqueue_failures: Mutex<HashMap<String, usize>>,
    ack_failures: Mutex<HashMap<String, usize>>,
    reconnects: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            enqueue_failures: Mutex::new(HashMap::new()),
            ack_failures: Mutex::new(HashMap::new()),
            reconnects: AtomicU64::new(0),
        }
    }

    /// While unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` enqueues onto `queue` fail.
    pub fn fail_enqueues(&self, queue: &str, count: usize) {
        self.enqueue_failures.lock().insert(queue.to_string(), count);
    }

    /// Make the next `count` acknowledgments on `queue` fail.
    pub fn fail_acks(&self, queue: &str, count: usize) {
        self.ack_failures.lock().insert(queue.to_string(), count);
    }

    /// Unread messages on `queue`, oldest first.
    pub fn ready(&self, queue: &str) -> Vec<QueuedMessage> {
        self.queues
            .lock()
            .get(queue)
            .map(|state| state.ready.iter().map(|(_, msg)| msg.clone()).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map(|state| state.pending.len())
            .unwrap_or(0)
    }

    /// Ids acknowledged on `queue`, in acknowledgment order.
    pub fn acked(&self, queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .get(queue)
            .map(|state| state.acked.clone())
            .unwrap_or_default()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> PipelineResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PipelineError::BrokerUnavailable("memory queue offline".into()))
        }
    }

    fn injected_failure(failures: &Mutex<HashMap<String, usize>>, queue: &str) -> bool {
        match failures.lock().get_mut(queue) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_ready(&self, queue: &str, consumer: &str) -> Option<Delivery> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(queue)?;
        let (message_id, message) = state.ready.pop_front()?;
        state
            .pending
            .insert(message_id.clone(), (consumer.to_string(), message.clone()));
        Some(Delivery {
            message_id,
            message,
        })
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBroker for MemoryQueue {
    async fn enqueue(&self, message: &QueuedMessage) -> PipelineResult<String> {
        self.ensure_available()?;

        if Self::injected_failure(&self.enqueue_failures, &message.queue) {
            return Err(PipelineError::BrokerUnavailable(format!(
                "injected enqueue failure on {}",
                message.queue
            )));
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message_id = format!("{}-{}", message.enqueued_at.timestamp_millis(), seq);

        self.queues
            .lock()
            .entry(message.queue.clone())
            .or_default()
            .ready
            .push_back((message_id.clone(), message.clone()));
        self.arrivals.notify_waiters();

        debug!(queue = %message.queue, message_id = %message_id, "enqueued");
        Ok(message_id)
    }

    async fn read_next(
        &self,
        queue: &str,
        consumer: &str,
        block: Duration,
    ) -> PipelineResult<Option<Delivery>> {
        self.ensure_available()?;

        let deadline = tokio::time::Instant::now() + block;
        loop {
            let arrived = self.arrivals.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(delivery) = self.take_ready(queue, consumer) {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Ok(None);
            }
            self.ensure_available()?;
        }
    }

    async fn ack(&self, queue: &str, message_id: &str) -> PipelineResult<()> {
        self.ensure_available()?;
        if Self::injected_failure(&self.ack_failures, queue) {
            return Err(PipelineError::BrokerUnavailable(format!(
                "injected ack failure on {queue}"
            )));
        }

        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        if state.pending.remove(message_id).is_some() {
            state.acked.push(message_id.to_string());
        } else {
            debug!(queue, message_id, "ack for unknown message ignored");
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> PipelineResult<usize> {
        self.ensure_available()?;

        Ok(self
            .queues
            .lock()
            .get(queue)
            .map(|state| state.ready.len() + state.pending.len())
            .unwrap_or(0))
    }

    async fn reconnect(&self) -> PipelineResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_read_and_ack() {
        let broker = MemoryQueue::new();
        let first = broker
            .enqueue(&QueuedMessage::new("q", b"1".to_vec()))
            .await
            .unwrap();
        broker
            .enqueue(&QueuedMessage::new("q", b"2".to_vec()))
            .await
            .unwrap();

        let delivery = broker.read_next("q", "c", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.message_id, first);
        assert_eq!(delivery.message.body, b"1");
        assert_eq!(broker.depth("q").await.unwrap(), 2);
        assert_eq!(broker.pending_count("q"), 1);

        broker.ack("q", &delivery.message_id).await.unwrap();
        assert_eq!(broker.depth("q").await.unwrap(), 1);
        assert_eq!(broker.acked("q"), vec![first]);
    }

    #[tokio::test]
    async fn read_on_empty_queue_times_out() {
        let broker = MemoryQueue::new();
        let read = broker
            .read_next("q", "c", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_enqueue() {
        let broker = std::sync::Arc::new(MemoryQueue::new());
        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.read_next("q", "c", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker
            .enqueue(&QueuedMessage::new("q", b"late".to_vec()))
            .await
            .unwrap();

        let delivery = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message.body, b"late");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let broker = MemoryQueue::new();
        broker.fail_enqueues("dlq", 1);

        let msg = QueuedMessage::new("dlq", b"x".to_vec());
        assert!(broker.enqueue(&msg).await.is_err());
        assert!(broker.enqueue(&msg).await.is_ok());
        assert_eq!(broker.ready("dlq").len(), 1);
    }

    #[tokio::test]
    async fn offline_broker_fails_everything() {
        let broker = MemoryQueue::new();
        broker.set_available(false);

        assert!(broker
            .enqueue(&QueuedMessage::new("q", vec![]))
            .await
            .is_err());
        assert!(broker.read_next("q", "c", Duration::ZERO).await.is_err());
        assert!(broker.reconnect().await.is_err());
        assert_eq!(broker.reconnect_count(), 1);
    }
}
