//! A single viewer's live connection.
//!
//! The connection owns a bounded outbound buffer that many broadcaster tasks
//! write into and exactly one writer task drains. Writers never wait: when
//! the buffer is full the newest payload is dropped for this connection only
//! (drop-newest policy), so one slow viewer cannot stall the others.
//!
//! Liveness probes travel on a separate small control channel so a full
//! event buffer never suppresses pings.

use crate::types::{ConnectionId, Payload, ResourceKey};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Default outbound buffer capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Pending probes beyond this are redundant and get dropped.
const CONTROL_CAPACITY: usize = 4;

/// A frame produced for the connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Liveness probe.
    Ping,
    /// Broadcast payload.
    Event(Payload),
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The viewer closed the stream.
    ClientClosed,
    /// Reading from the stream failed.
    ReadError,
    /// Writing to the stream failed.
    WriteError,
    /// No liveness acknowledgment within the heartbeat timeout.
    HeartbeatTimeout,
    /// The registry is shutting down.
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::ReadError => "read_error",
            DisconnectReason::WriteError => "write_error",
            DisconnectReason::HeartbeatTimeout => "heartbeat_timeout",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Payload is in the outbound buffer.
    Queued,
    /// Buffer was full; payload dropped for this connection.
    Dropped,
    /// Connection is closed; nothing was queued.
    Closed,
}

/// Counters for a single connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub queued: u64,
    pub dropped: u64,
}

/// One viewer's duplex stream as seen by the hub.
pub struct LiveConnection {
    id: ConnectionId,
    key: ResourceKey,
    capacity: usize,
    outbound: mpsc::Sender<Payload>,
    control: mpsc::Sender<()>,
    last_liveness: Mutex<Instant>,
    cancel: CancellationToken,
    disconnect_reason: OnceLock<DisconnectReason>,
    queued: AtomicU64,
    dropped: AtomicU64,
}

impl LiveConnection {
    /// Create a connection for `key` with an outbound buffer of `capacity`
    /// payloads (at least 1). Returns the shared handle and the drain side.
    pub fn new(key: ResourceKey, capacity: usize) -> (Arc<Self>, OutboundReceiver) {
        let capacity = capacity.max(1);
        let (outbound, events) = mpsc::channel(capacity);
        let (control, control_rx) = mpsc::channel(CONTROL_CAPACITY);

        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            key,
            capacity,
            outbound,
            control,
            last_liveness: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            disconnect_reason: OnceLock::new(),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let receiver = OutboundReceiver {
            events,
            control: control_rx,
        };

        (connection, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue a payload without waiting. A full buffer drops the payload.
    pub fn try_enqueue(&self, payload: Payload) -> EnqueueOutcome {
        if self.cancel.is_cancelled() {
            return EnqueueOutcome::Closed;
        }

        match self.outbound.try_send(payload) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Ask the writer to send a liveness probe. Returns false if the
    /// connection is closed or probes are already backed up.
    pub fn probe(&self) -> bool {
        !self.cancel.is_cancelled() && self.control.try_send(()).is_ok()
    }

    /// Record a liveness acknowledgment (pong or any inbound frame).
    pub fn record_liveness(&self) {
        self.record_liveness_at(Instant::now());
    }

    pub fn record_liveness_at(&self, at: Instant) {
        *self.last_liveness.lock() = at;
    }

    pub fn last_liveness(&self) -> Instant {
        *self.last_liveness.lock()
    }

    /// Time since the last liveness acknowledgment.
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_liveness())
    }

    /// Close the connection. Only the first call wins and records its reason.
    pub(crate) fn close(&self, reason: DisconnectReason) -> bool {
        let first = self.disconnect_reason.set(reason).is_ok();
        if first {
            self.cancel.cancel();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason.get().copied()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drain side of a connection, owned by its single writer task.
pub struct OutboundReceiver {
    events: mpsc::Receiver<Payload>,
    control: mpsc::Receiver<()>,
}

impl OutboundReceiver {
    /// Wait for the next frame. Probes take priority over events.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            Some(()) = self.control.recv() => Some(Frame::Ping),
            event = self.events.recv() => event.map(Frame::Event),
        }
    }

    /// Take the next frame if one is ready.
    pub fn try_recv(&mut self) -> Option<Frame> {
        if self.control.try_recv().is_ok() {
            return Some(Frame::Ping);
        }
        self.try_recv_event().map(Frame::Event)
    }

    /// Take the next buffered event, ignoring probes.
    pub fn try_recv_event(&mut self) -> Option<Payload> {
        self.events.try_recv().ok()
    }
}
