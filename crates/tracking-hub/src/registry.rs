//! Connection registry: which live connections watch which resource key.
//!
//! # Invariants
//!
//! 1. An entry for a key exists iff at least one connection is subscribed.
//! 2. With a bridge configured, an entry exists iff it holds a forwarder
//!    handle. Both are created and removed under the same write lock.
//! 3. Broadcasting snapshots the subscriber set under a read lock and
//!    enqueues after releasing it. It never waits on a connection.
//! 4. [`ConnectionRegistry::disconnect`] is the only teardown path and
//!    returns `true` exactly once per connection.

use crate::bridge::CrossInstanceBridge;
use crate::connection::{DisconnectReason, EnqueueOutcome, LiveConnection};
use crate::error::{HubError, HubResult};
use crate::types::{ConnectionId, Payload, ResourceKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What happened when a connection subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub key: ResourceKey,
    /// Subscribers on the key after this one was added.
    pub subscribers: usize,
    /// Whether this subscription started the key's forwarder.
    pub started_forwarder: bool,
}

/// Result of a local broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the payload was queued for.
    pub delivered: usize,
    /// Connections whose buffer was full.
    pub dropped: usize,
}

pub(crate) struct ForwarderHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct KeyEntry {
    connections: HashMap<ConnectionId, Arc<LiveConnection>>,
    forwarder: Option<ForwarderHandle>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ResourceKey, KeyEntry>,
    shutting_down: bool,
}

pub(crate) struct RegistryInner {
    state: RwLock<RegistryState>,
    bridge: Option<CrossInstanceBridge>,
    root: CancellationToken,
}

impl RegistryInner {
    pub(crate) fn broadcast_local(&self, key: &ResourceKey, payload: Payload) -> BroadcastReport {
        let snapshot: Vec<Arc<LiveConnection>> = {
            let state = self.state.read();
            match state.entries.get(key) {
                Some(entry) => entry.connections.values().cloned().collect(),
                None => return BroadcastReport::default(),
            }
        };

        let mut report = BroadcastReport::default();
        for connection in snapshot {
            match connection.try_enqueue(payload.clone()) {
                EnqueueOutcome::Queued => report.delivered += 1,
                EnqueueOutcome::Dropped => {
                    report.dropped += 1;
                    debug!(
                        key = %key,
                        connection_id = %connection.id(),
                        "outbound buffer full, payload dropped"
                    );
                }
                EnqueueOutcome::Closed => {}
            }
        }
        report
    }
}

/// Shared handle to the registry. Clones refer to the same registry.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create a registry. With a bridge, every active key gets one forwarder
    /// relaying broker messages into [`broadcast_local`](Self::broadcast_local).
    pub fn new(bridge: Option<CrossInstanceBridge>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                bridge,
                root: CancellationToken::new(),
            }),
        }
    }

    /// Registry without cross-instance forwarding.
    pub fn local() -> Self {
        Self::new(None)
    }

    pub fn bridge(&self) -> Option<&CrossInstanceBridge> {
        self.inner.bridge.as_ref()
    }

    /// Add `connection` under its key. The first subscriber of a key starts
    /// the key's forwarder.
    ///
    /// Must be called from within a tokio runtime when a bridge is set.
    pub fn subscribe(&self, connection: Arc<LiveConnection>) -> HubResult<SubscribeOutcome> {
        let key = connection.key().clone();
        let mut state = self.inner.state.write();

        if state.shutting_down {
            return Err(HubError::ShuttingDown);
        }
        if connection.is_closed() {
            return Err(HubError::ConnectionClosed);
        }

        let entry = state.entries.entry(key.clone()).or_insert_with(|| KeyEntry {
            connections: HashMap::new(),
            forwarder: None,
        });

        let mut started_forwarder = false;
        if entry.forwarder.is_none() {
            if let Some(bridge) = &self.inner.bridge {
                let cancel = self.inner.root.child_token();
                let registry = Arc::downgrade(&self.inner);
                let task = bridge.spawn_forwarder(key.clone(), registry, cancel.clone());
                entry.forwarder = Some(ForwarderHandle { cancel, task });
                started_forwarder = true;
            }
        }

        entry.connections.insert(connection.id(), connection.clone());
        let subscribers = entry.connections.len();
        drop(state);

        debug!(
            key = %key,
            connection_id = %connection.id(),
            subscribers,
            started_forwarder,
            "connection subscribed"
        );

        Ok(SubscribeOutcome {
            key,
            subscribers,
            started_forwarder,
        })
    }

    /// Remove `connection`. Removing the last subscriber of a key removes the
    /// entry and stops its forwarder. Returns whether it was subscribed.
    pub fn unsubscribe(&self, connection: &LiveConnection) -> bool {
        let key = connection.key();
        let mut state = self.inner.state.write();

        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        if entry.connections.remove(&connection.id()).is_none() {
            return false;
        }

        if entry.connections.is_empty() {
            if let Some(entry) = state.entries.remove(key) {
                if let Some(forwarder) = entry.forwarder {
                    forwarder.cancel.cancel();
                }
            }
            drop(state);
            debug!(key = %key, "last subscriber left, key released");
        } else {
            drop(state);
        }

        debug!(key = %key, connection_id = %connection.id(), "connection unsubscribed");
        true
    }

    /// Queue `payload` for every connection subscribed to `key` on this
    /// instance.
    pub fn broadcast_local(&self, key: &ResourceKey, payload: Payload) -> BroadcastReport {
        self.inner.broadcast_local(key, payload)
    }

    /// Close `connection` and unsubscribe it. Only the first call for a
    /// connection does anything and returns `true`.
    pub fn disconnect(&self, connection: &LiveConnection, reason: DisconnectReason) -> bool {
        if !connection.close(reason) {
            return false;
        }

        self.unsubscribe(connection);
        let stats = connection.stats();
        info!(
            key = %connection.key(),
            connection_id = %connection.id(),
            reason = %reason,
            queued = stats.queued,
            dropped = stats.dropped,
            "connection disconnected"
        );
        true
    }

    /// Stop accepting subscribers, close every connection and wait for all
    /// forwarders to exit.
    pub async fn shutdown(&self) {
        let (connections, forwarders) = {
            let mut state = self.inner.state.write();
            state.shutting_down = true;

            let mut connections = Vec::new();
            let mut forwarders = Vec::new();
            for (_, entry) in state.entries.drain() {
                connections.extend(entry.connections.into_values());
                if let Some(forwarder) = entry.forwarder {
                    forwarder.cancel.cancel();
                    forwarders.push(forwarder.task);
                }
            }
            (connections, forwarders)
        };

        self.inner.root.cancel();

        let closed = connections
            .iter()
            .filter(|connection| connection.close(DisconnectReason::Shutdown))
            .count();

        for task in forwarders {
            let _ = task.await;
        }

        info!(connections = closed, "registry shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.read().shutting_down
    }

    /// Number of keys with at least one subscriber.
    pub fn key_count(&self) -> usize {
        self.inner.state.read().entries.len()
    }

    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.inner
            .state
            .read()
            .entries
            .get(key)
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    /// Total subscribed connections across all keys.
    pub fn connection_count(&self) -> usize {
        self.inner
            .state
            .read()
            .entries
            .values()
            .map(|entry| entry.connections.len())
            .sum()
    }

    pub fn has_forwarder(&self, key: &ResourceKey) -> bool {
        self.inner
            .state
            .read()
            .entries
            .get(key)
            .is_some_and(|entry| entry.forwarder.is_some())
    }

    /// Forwarder handles currently held. Cancelled forwarders may still be
    /// winding down; see [`CrossInstanceBridge::running_forwarders`].
    pub fn forwarder_count(&self) -> usize {
        self.inner
            .state
            .read()
            .entries
            .values()
            .filter(|entry| entry.forwarder.is_some())
            .count()
    }

    /// Subscriber count and forwarder presence for `key`, read under one lock.
    #[cfg(test)]
    pub(crate) fn observe(&self, key: &ResourceKey) -> (usize, bool) {
        let state = self.inner.state.read();
        match state.entries.get(key) {
            Some(entry) => (entry.connections.len(), entry.forwarder.is_some()),
            None => (0, false),
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("keys", &self.key_count())
            .field("bridged", &self.inner.bridge.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(key: &str) -> (Arc<LiveConnection>, crate::connection::OutboundReceiver) {
        LiveConnection::new(key.into(), 8)
    }

    #[test]
    fn entry_exists_only_while_subscribed() {
        let registry = ConnectionRegistry::local();
        let (a, _ra) = conn("7");
        let (b, _rb) = conn("7");

        let first = registry.subscribe(a.clone()).unwrap();
        assert_eq!(first.subscribers, 1);
        assert!(!first.started_forwarder);
        assert_eq!(registry.subscribe(b.clone()).unwrap().subscribers, 2);
        assert_eq!(registry.key_count(), 1);

        assert!(registry.unsubscribe(&a));
        assert_eq!(registry.subscriber_count(&"7".into()), 1);
        assert!(registry.unsubscribe(&b));
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = ConnectionRegistry::local();
        let (a, _ra) = conn("7");

        registry.subscribe(a.clone()).unwrap();
        assert!(registry.unsubscribe(&a));
        assert!(!registry.unsubscribe(&a));
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn broadcast_to_unknown_key_is_a_no_op() {
        let registry = ConnectionRegistry::local();
        let report = registry.broadcast_local(&"missing".into(), Arc::from("x"));
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn disconnect_happens_once() {
        let registry = ConnectionRegistry::local();
        let (a, _ra) = conn("7");
        registry.subscribe(a.clone()).unwrap();

        assert!(registry.disconnect(&a, DisconnectReason::ClientClosed));
        assert!(!registry.disconnect(&a, DisconnectReason::HeartbeatTimeout));
        assert_eq!(a.disconnect_reason(), Some(DisconnectReason::ClientClosed));
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn closed_connection_cannot_subscribe() {
        let registry = ConnectionRegistry::local();
        let (a, _ra) = conn("7");
        registry.disconnect(&a, DisconnectReason::ReadError);

        assert!(matches!(
            registry.subscribe(a),
            Err(HubError::ConnectionClosed)
        ));
        assert_eq!(registry.key_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_subscribers() {
        let registry = ConnectionRegistry::local();
        let (a, _ra) = conn("7");
        registry.subscribe(a.clone()).unwrap();

        registry.shutdown().await;

        assert!(a.is_closed());
        assert_eq!(a.disconnect_reason(), Some(DisconnectReason::Shutdown));
        assert!(registry.is_shutting_down());

        let (b, _rb) = conn("7");
        assert!(matches!(registry.subscribe(b), Err(HubError::ShuttingDown)));
    }
}
