//! Redis Streams queue broker.
//!
//! Each queue is a stream. Entries carry three fields:
//!
//! ```text
//! XADD <queue> * body <json> x-retry-count <n> enqueued_at <rfc3339>
//! ```
//!
//! Consumers read through one consumer group with `XREADGROUP COUNT 1`.
//! Acknowledging runs `XACK` and `XDEL` in one atomic pipeline, so the
//! stream only ever holds outstanding work. Because of that the group is
//! created at id `0`: anything already on the stream is still owed.
//!
//! Entries that were read but never acknowledged stay in the group's pending
//! list. They are picked up again two ways:
//!
//! - a fresh reader (new process, or after a reconnect) first drains its own
//!   pending entries with `XREADGROUP ... STREAMS <queue> 0`
//! - every [`CLAIM_INTERVAL`] a reader runs `XAUTOCLAIM` for entries idle
//!   longer than the claim threshold, which recovers work left behind by
//!   consumers that are gone

use crate::broker::QueueBroker;
use crate::error::{PipelineError, PipelineResult};
use crate::message::{parse_retry_count, Delivery, QueuedMessage, RETRY_COUNT_HEADER};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult, Value};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default consumer group name.
pub const DEFAULT_CONSUMER_GROUP: &str = "tracking";

/// Pending entries idle this long are claimed from their consumer.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(300);

/// How often each queue is checked for idle pending entries.
pub const CLAIM_INTERVAL: Duration = Duration::from_secs(30);

const FIELD_BODY: &str = "body";
const FIELD_ENQUEUED_AT: &str = "enqueued_at";

/// Redis Streams-backed [`QueueBroker`].
pub struct RedisQueue {
    client: Client,
    conn: Mutex<MultiplexedConnection>,
    /// Blocking reads tie up their connection, so every consumer gets one.
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
    group: String,
    groups_ready: parking_lot::Mutex<HashSet<String>>,
    /// Readers whose own pending entries have been drained.
    recovered: parking_lot::Mutex<HashSet<String>>,
    last_claim: parking_lot::Mutex<HashMap<String, Instant>>,
    claim_idle: Duration,
}

impl RedisQueue {
    /// Connect to Redis and use `group` as the consumer group for all queues.
    pub async fn connect(redis_url: &str, group: impl Into<String>) -> PipelineResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let group = group.into();

        info!(url = %redis_url, group = %group, "connected to redis streams");

        Ok(Self {
            client,
            conn: Mutex::new(conn),
            readers: Mutex::new(HashMap::new()),
            group,
            groups_ready: parking_lot::Mutex::new(HashSet::new()),
            recovered: parking_lot::Mutex::new(HashSet::new()),
            last_claim: parking_lot::Mutex::new(HashMap::new()),
            claim_idle: DEFAULT_CLAIM_IDLE,
        })
    }

    /// Claim pending entries once they have been idle for `claim_idle`.
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    async fn command_conn(&self) -> MultiplexedConnection {
        self.conn.lock().await.clone()
    }

    async fn reader_conn(&self, reader: &str) -> PipelineResult<MultiplexedConnection> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(reader) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        readers.insert(reader.to_string(), conn.clone());
        Ok(conn)
    }

    /// Create the consumer group for `queue` if this process has not yet.
    async fn ensure_group(&self, queue: &str) -> PipelineResult<()> {
        if self.groups_ready.lock().contains(queue) {
            return Ok(());
        }

        // XGROUP CREATE key groupname id MKSTREAM
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.command_conn().await)
            .await;

        match result {
            Ok(()) => {
                info!(queue, group = %self.group, "created consumer group");
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(queue, group = %self.group, "consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }

        self.groups_ready.lock().insert(queue.to_string());
        Ok(())
    }

    fn claim_due(&self, queue: &str) -> bool {
        self.last_claim
            .lock()
            .get(queue)
            .map_or(true, |at| at.elapsed() >= CLAIM_INTERVAL)
    }

    /// `XREADGROUP` from `start`: `>` for new entries, `0` for this
    /// consumer's pending ones.
    async fn read_group(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        consumer: &str,
        start: &str,
        block: Duration,
    ) -> PipelineResult<Option<StreamEntry>> {
        // XREADGROUP GROUP g c COUNT 1 [BLOCK ms] STREAMS key start
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1);
        if !block.is_zero() {
            // BLOCK 0 would wait forever.
            cmd.arg("BLOCK").arg((block.as_millis() as u64).max(1));
        }
        cmd.arg("STREAMS").arg(queue).arg(start);

        let value: Value = cmd.query_async(conn).await?;
        parse_xreadgroup_response(value)
    }

    async fn autoclaim(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        consumer: &str,
    ) -> PipelineResult<Option<StreamEntry>> {
        // XAUTOCLAIM key group consumer min-idle-ms start COUNT 1
        let value: Value = redis::cmd("XAUTOCLAIM")
            .arg(queue)
            .arg(&self.group)
            .arg(consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await?;
        parse_xautoclaim_response(value)
    }

    /// Pending entries first, then idle entries from other consumers, then
    /// new entries.
    async fn next_entry(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        consumer: &str,
        reader: &str,
        block: Duration,
    ) -> PipelineResult<Option<Delivery>> {
        loop {
            let entry = if !self.recovered.lock().contains(reader) {
                let pending = self.read_group(conn, queue, consumer, "0", Duration::ZERO).await?;
                let Some(entry) = pending else {
                    self.recovered.lock().insert(reader.to_string());
                    continue;
                };
                info!(queue, consumer, message_id = %entry.id, "redelivering pending entry");
                entry
            } else if self.claim_due(queue) {
                let Some(entry) = self.autoclaim(conn, queue, consumer).await? else {
                    self.last_claim.lock().insert(queue.to_string(), Instant::now());
                    continue;
                };
                warn!(queue, consumer, message_id = %entry.id, "claimed idle pending entry");
                entry
            } else {
                match self.read_group(conn, queue, consumer, ">", block).await? {
                    Some(entry) => entry,
                    None => return Ok(None),
                }
            };

            match entry.fields {
                Some(fields) => return Ok(Some(delivery_from_fields(queue, entry.id, fields))),
                None => {
                    // Deleted while pending; only the pending record is left.
                    debug!(queue, message_id = %entry.id, "dropping pending entry with no body");
                    self.ack(queue, &entry.id).await?;
                }
            }
        }
    }
}

#[async_trait]
impl QueueBroker for RedisQueue {
    async fn enqueue(&self, message: &QueuedMessage) -> PipelineResult<String> {
        let message_id: String = redis::cmd("XADD")
            .arg(&message.queue)
            .arg("*")
            .arg(FIELD_BODY)
            .arg(&message.body)
            .arg(RETRY_COUNT_HEADER)
            .arg(message.retry_count)
            .arg(FIELD_ENQUEUED_AT)
            .arg(message.enqueued_at.to_rfc3339())
            .query_async(&mut self.command_conn().await)
            .await?;

        debug!(
            queue = %message.queue,
            message_id = %message_id,
            retry_count = message.retry_count,
            "enqueued"
        );
        Ok(message_id)
    }

    async fn read_next(
        &self,
        queue: &str,
        consumer: &str,
        block: Duration,
    ) -> PipelineResult<Option<Delivery>> {
        self.ensure_group(queue).await?;

        let reader = format!("{queue}/{consumer}");
        let mut conn = self.reader_conn(&reader).await?;

        let result = self.next_entry(&mut conn, queue, consumer, &reader, block).await;
        if let Err(PipelineError::Redis(e)) = &result {
            if e.to_string().contains("NOGROUP") {
                // Stream was deleted underneath us; recreate next time.
                self.groups_ready.lock().remove(queue);
            }
            if e.is_io_error() || e.is_connection_dropped() {
                // A reply may have been lost, so drain pending entries again.
                self.readers.lock().await.remove(&reader);
                self.recovered.lock().remove(&reader);
            }
        }
        result
    }

    async fn ack(&self, queue: &str, message_id: &str) -> PipelineResult<()> {
        let _: () = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(queue)
            .arg(&self.group)
            .arg(message_id)
            .ignore()
            .cmd("XDEL")
            .arg(queue)
            .arg(message_id)
            .ignore()
            .query_async(&mut self.command_conn().await)
            .await?;

        debug!(queue, message_id, "acknowledged");
        Ok(())
    }

    async fn depth(&self, queue: &str) -> PipelineResult<usize> {
        let len: usize = redis::cmd("XLEN")
            .arg(queue)
            .query_async(&mut self.command_conn().await)
            .await?;
        Ok(len)
    }

    async fn reconnect(&self) -> PipelineResult<()> {
        let fresh = self.client.get_multiplexed_async_connection().await?;
        *self.conn.lock().await = fresh;
        self.readers.lock().await.clear();
        self.recovered.lock().clear();
        warn!(group = %self.group, "reconnected to redis streams");
        Ok(())
    }
}

/// One stream entry. `fields` is `None` when the entry was deleted but is
/// still in the pending list.
#[derive(Debug)]
struct StreamEntry {
    id: String,
    fields: Option<HashMap<String, Vec<u8>>>,
}

fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes.clone()),
        Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        Value::Int(n) => Some(n.to_string().into_bytes()),
        _ => None,
    }
}

/// Extract the single entry from an `XREADGROUP ... COUNT 1` reply.
///
/// Reply shape: `[[stream_key, [[message_id, [field, value, ...]]]]]`.
fn parse_xreadgroup_response(value: Value) -> PipelineResult<Option<StreamEntry>> {
    let streams = match value {
        Value::Nil => return Ok(None),
        Value::Array(streams) => streams,
        other => {
            return Err(PipelineError::Protocol(format!(
                "Unexpected XREADGROUP response type: {other:?}"
            )))
        }
    };

    let Some(stream) = streams.into_iter().next() else {
        return Ok(None);
    };
    let Value::Array(mut stream) = stream else {
        return Err(PipelineError::Protocol(
            "Expected array for stream entry".to_string(),
        ));
    };
    if stream.len() < 2 {
        return Err(PipelineError::Protocol("Stream entry too short".to_string()));
    }

    first_entry(stream.swap_remove(1))
}

/// Extract the single entry from an `XAUTOCLAIM ... COUNT 1` reply.
///
/// Reply shape: `[next_start, [[message_id, [field, value, ...]]], [deleted_id, ...]]`
/// where the trailing list of deleted ids only exists on Redis 7.
fn parse_xautoclaim_response(value: Value) -> PipelineResult<Option<StreamEntry>> {
    let mut reply = match value {
        Value::Array(reply) => reply,
        other => {
            return Err(PipelineError::Protocol(format!(
                "Unexpected XAUTOCLAIM response type: {other:?}"
            )))
        }
    };
    if reply.len() < 2 {
        return Err(PipelineError::Protocol("XAUTOCLAIM reply too short".to_string()));
    }

    first_entry(reply.swap_remove(1))
}

fn first_entry(messages: Value) -> PipelineResult<Option<StreamEntry>> {
    let Value::Array(messages) = messages else {
        return Err(PipelineError::Protocol(
            "Expected array for messages".to_string(),
        ));
    };
    match messages.into_iter().next() {
        Some(message) => parse_entry(message).map(Some),
        None => Ok(None),
    }
}

fn parse_entry(message: Value) -> PipelineResult<StreamEntry> {
    let Value::Array(message) = message else {
        return Err(PipelineError::Protocol(
            "Expected array for message".to_string(),
        ));
    };
    if message.len() < 2 {
        return Err(PipelineError::Protocol("Message entry too short".to_string()));
    }

    let id = value_to_bytes(&message[0])
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .ok_or_else(|| {
            PipelineError::Protocol(format!(
                "Expected string for message ID, got {:?}",
                message[0]
            ))
        })?;

    let raw_fields = match &message[1] {
        Value::Array(raw_fields) => raw_fields,
        Value::Nil => return Ok(StreamEntry { id, fields: None }),
        _ => {
            return Err(PipelineError::Protocol(
                "Expected array for fields".to_string(),
            ))
        }
    };

    let mut fields = HashMap::new();
    for pair in raw_fields.chunks(2) {
        if let [name, value] = pair {
            if let (Some(name), Some(value)) = (value_to_bytes(name), value_to_bytes(value)) {
                fields.insert(String::from_utf8_lossy(&name).into_owned(), value);
            }
        }
    }

    Ok(StreamEntry {
        id,
        fields: Some(fields),
    })
}

fn delivery_from_fields(
    queue: &str,
    message_id: String,
    mut fields: HashMap<String, Vec<u8>>,
) -> Delivery {
    let body = fields.remove(FIELD_BODY).unwrap_or_default();
    let retry_count = parse_retry_count(
        fields
            .get(RETRY_COUNT_HEADER)
            .and_then(|raw| std::str::from_utf8(raw).ok()),
    );
    let enqueued_at = fields
        .get(FIELD_ENQUEUED_AT)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Delivery {
        message_id,
        message: QueuedMessage {
            queue: queue.to_string(),
            body,
            retry_count,
            enqueued_at,
        },
    }
}
