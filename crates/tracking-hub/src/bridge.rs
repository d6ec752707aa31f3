//! Cross-instance bridge.
//!
//! Events are published to a broker topic derived from the resource key.
//! Each instance runs one forwarder per locally active key that subscribes
//! to that topic and re-broadcasts everything it receives to the local
//! subscribers, so a viewer sees events no matter which instance produced
//! them.

use crate::broker::PubSubBroker;
use crate::error::HubResult;
use crate::registry::RegistryInner;
use crate::types::ResourceKey;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default broker topic prefix.
pub const DEFAULT_TOPIC_PREFIX: &str = "ws:delivery:";

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Prepended to the resource key to form the topic name.
    pub topic_prefix: String,
    /// First delay before resubscribing after a lost subscription.
    pub reconnect_base: Duration,
    /// Upper bound for the resubscribe delay.
    pub reconnect_max: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            reconnect_base: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
        }
    }
}

impl BridgeConfig {
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }
}

/// Publishes events for a key and relays broker messages into a registry.
#[derive(Clone)]
pub struct CrossInstanceBridge {
    broker: Arc<dyn PubSubBroker>,
    config: BridgeConfig,
    running: Arc<AtomicUsize>,
}

impl CrossInstanceBridge {
    pub fn new(broker: Arc<dyn PubSubBroker>, config: BridgeConfig) -> Self {
        Self {
            broker,
            config,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn topic_for(&self, key: &ResourceKey) -> String {
        format!("{}{}", self.config.topic_prefix, key)
    }

    /// Publish raw bytes for `key`. Needs no local subscriber. Returns the
    /// broker-reported receiver count.
    pub async fn publish(&self, key: &ResourceKey, payload: &[u8]) -> HubResult<usize> {
        let topic = self.topic_for(key);
        let receivers = self.broker.publish(&topic, payload).await?;
        debug!(topic = %topic, receivers, bytes = payload.len(), "published event");
        Ok(receivers)
    }

    /// Serialize `event` as JSON and publish it for `key`.
    pub async fn publish_event<T: Serialize + ?Sized>(
        &self,
        key: &ResourceKey,
        event: &T,
    ) -> HubResult<usize> {
        let payload = serde_json::to_vec(event)?;
        self.publish(key, &payload).await
    }

    /// Forwarder tasks currently alive across every registry using this
    /// bridge.
    pub fn running_forwarders(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn spawn_forwarder(
        &self,
        key: ResourceKey,
        registry: Weak<RegistryInner>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        let guard = RunningGuard::enter(&self.running);
        tokio::spawn(async move {
            let _guard = guard;
            bridge.forward(key, registry, cancel).await;
        })
    }

    async fn forward(
        &self,
        key: ResourceKey,
        registry: Weak<RegistryInner>,
        cancel: CancellationToken,
    ) {
        let topic = self.topic_for(&key);
        let mut delay = self.config.reconnect_base;

        debug!(topic = %topic, "forwarder started");

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.broker.subscribe(&topic) => result,
            };

            match subscribed {
                Ok(mut messages) => {
                    delay = self.config.reconnect_base;

                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            next = messages.next() => next,
                        };
                        let Some(bytes) = next else {
                            break;
                        };
                        if cancel.is_cancelled() {
                            break;
                        }
                        let Some(registry) = registry.upgrade() else {
                            debug!(topic = %topic, "registry dropped, forwarder exiting");
                            return;
                        };

                        match String::from_utf8(bytes) {
                            Ok(text) => {
                                registry.broadcast_local(&key, Arc::from(text));
                            }
                            Err(e) => {
                                warn!(topic = %topic, error = %e, "skipping non-UTF-8 payload");
                            }
                        }
                    }

                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(topic = %topic, "broker subscription ended, resubscribing");
                }
                Err(e) => {
                    warn!(
                        topic = %topic,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "broker subscribe failed"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.reconnect_max);
        }

        debug!(topic = %topic, "forwarder stopped");
    }
}

impl std::fmt::Debug for CrossInstanceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossInstanceBridge")
            .field("config", &self.config)
            .field("running_forwarders", &self.running_forwarders())
            .finish()
    }
}

/// Counts a forwarder as running from spawn until its task is dropped.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
