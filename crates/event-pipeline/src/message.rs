//! Queued messages and their retry metadata.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

/// Name of the retry counter carried next to every message body.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// A message as stored on a queue.
///
/// The body is opaque JSON. `retry_count` starts at 0 when a producer
/// publishes and grows by exactly one each time the message is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub queue: String,
    pub body: Vec<u8>,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// A fresh message with retry count 0.
    pub fn new(queue: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            queue: queue.into(),
            body,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// The body as text, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// A message handed to a consumer, with the id needed to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub message: QueuedMessage,
}

/// Parse a stored retry counter. Missing or unreadable values count as 0.
pub fn parse_retry_count(raw: Option<&str>) -> u32 {
    raw.and_then(|value| value.trim().parse().ok()).unwrap_or(0)
}
