//! Topic-based publish/subscribe transport between server instances.
//!
//! The hub only needs two things from a broker: publish bytes to a topic,
//! and get a stream of everything published to a topic from now on.
//! [`MemoryPubSub`] keeps both ends inside one process; the Redis-backed
//! implementation lives in [`crate::redis_pubsub`].

use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Messages delivered on a subscribed topic. Ends when the subscription is
/// lost.
pub type MessageStream = BoxStream<'static, Vec<u8>>;

/// A topic-based pub/sub transport.
#[async_trait]
pub trait PubSubBroker: Send + Sync {
    /// Publish `payload` on `topic`. Returns the number of subscribers the
    /// broker handed it to.
    async fn publish(&self, topic: &str, payload: &[u8]) -> HubResult<usize>;

    /// Subscribe to `topic`.
    async fn subscribe(&self, topic: &str) -> HubResult<MessageStream>;
}

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

struct Topic {
    sender: broadcast::Sender<Arc<[u8]>>,
    kill: CancellationToken,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            kill: CancellationToken::new(),
        }
    }
}

/// In-process broker. Share one `Arc<MemoryPubSub>` between registries to
/// model several instances on one broker.
pub struct MemoryPubSub {
    topics: Mutex<HashMap<String, Topic>>,
    available: AtomicBool,
    capacity: usize,
    subscribe_calls: AtomicUsize,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Each subscriber may fall `capacity` messages behind before it starts
    /// skipping.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            capacity: capacity.max(1),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    /// Simulate an outage: while unavailable, publish and subscribe fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// End every open subscription stream on `topic`, as if the broker
    /// connection had dropped. Returns how many subscriptions were cut.
    pub fn drop_subscriptions(&self, topic: &str) -> usize {
        let mut topics = self.topics.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return 0;
        };

        let cut = entry.sender.receiver_count();
        entry.kill.cancel();
        entry.kill = CancellationToken::new();
        debug!(topic, cut, "dropped subscriptions");
        cut
    }

    /// Number of live subscription streams on `topic`.
    pub fn active_subscriptions(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|entry| entry.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Successful subscribe calls across all topics.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> HubResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HubError::Broker("broker unavailable".into()))
        }
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubBroker for MemoryPubSub {
    async fn publish(&self, topic: &str, payload: &[u8]) -> HubResult<usize> {
        self.ensure_available()?;

        let mut topics = self.topics.lock();
        let Some(entry) = topics.get(topic) else {
            return Ok(0);
        };

        match entry.sender.send(Arc::from(payload)) {
            Ok(receivers) => Ok(receivers),
            Err(_) => {
                // Nobody listening any more.
                topics.remove(topic);
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> HubResult<MessageStream> {
        self.ensure_available()?;

        let (receiver, kill) = {
            let mut topics = self.topics.lock();
            let entry = topics
                .entry(topic.to_string())
                .or_insert_with(|| Topic::new(self.capacity));
            (entry.sender.subscribe(), entry.kill.clone())
        };
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let topic = topic.to_string();
        let messages = stream::unfold(
            (receiver, kill, topic),
            |(mut receiver, kill, topic)| async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = kill.cancelled() => return None,
                        received = receiver.recv() => match received {
                            Ok(payload) => {
                                return Some((payload.to_vec(), (receiver, kill, topic)));
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(
                                    topic = %topic,
                                    skipped,
                                    "subscriber lagged, messages skipped"
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        },
                    }
                }
            },
        );

        Ok(messages.boxed())
    }
}
