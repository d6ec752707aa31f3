//! Tracking hub: live per-delivery fan-out to connected viewers.
//!
//! Viewers hold a [`LiveConnection`] subscribed under a [`ResourceKey`] (one
//! key per delivery). Events for a key are fanned out to every local
//! subscriber by the [`ConnectionRegistry`] and, across server instances, by
//! the [`CrossInstanceBridge`] through a [`PubSubBroker`].
//!
//! # Guarantees
//!
//! 1. **Non-blocking fan-out**: a slow viewer loses events (drop-newest) but
//!    never delays other viewers or the publisher.
//! 2. **One forwarder per key**: each instance subscribes to a key's broker
//!    topic at most once, and only while it has local viewers.
//! 3. **Single teardown**: every connection is disconnected and
//!    unsubscribed exactly once, whatever ends it.
//! 4. **Bounded silence**: the [`HeartbeatMonitor`] drops a silent viewer
//!    within `timeout + interval`.
//!
//! # Architecture
//!
//! ```text
//! publisher -> bridge.publish -> broker topic ws:delivery:<key>
//!                                    |
//!            (one forwarder per key per instance)
//!                                    v
//!                   registry.broadcast_local(key)
//!                          |        |        |
//!                        conn     conn     conn  -> writer task -> socket
//! ```

pub mod bridge;
pub mod broker;
pub mod connection;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod redis_pubsub;
pub mod registry;
pub mod types;

#[cfg(test)]
mod tests;

pub use bridge::{BridgeConfig, CrossInstanceBridge, DEFAULT_TOPIC_PREFIX};
pub use broker::{MemoryPubSub, MessageStream, PubSubBroker};
pub use connection::{
    ConnectionStats, DisconnectReason, EnqueueOutcome, Frame, LiveConnection, OutboundReceiver,
    DEFAULT_OUTBOUND_CAPACITY,
};
pub use error::{HubError, HubResult};
pub use event::{ScanType, TrackingEvent};
pub use heartbeat::{HeartbeatConfig, HeartbeatExit, HeartbeatMonitor, HeartbeatState, Liveness};
pub use redis_pubsub::RedisPubSub;
pub use registry::{BroadcastReport, ConnectionRegistry, SubscribeOutcome};
pub use types::{ConnectionId, Payload, ResourceKey};
