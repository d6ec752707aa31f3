//! Redis pub/sub transport.
//!
//! Publishing shares one multiplexed connection. Each subscription gets its
//! own dedicated pub/sub connection, so losing one forwarder's connection
//! never affects another key.

use crate::broker::{MessageStream, PubSubBroker};
use crate::error::HubResult;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Redis-backed [`PubSubBroker`].
pub struct RedisPubSub {
    client: Client,
    conn: Mutex<MultiplexedConnection>,
}

impl RedisPubSub {
    /// Connect to Redis at `redis_url`.
    pub async fn connect(redis_url: &str) -> HubResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        info!(url = %redis_url, "connected to redis pub/sub");

        Ok(Self {
            client,
            conn: Mutex::new(conn),
        })
    }

    async fn publish_once(&self, topic: &str, payload: &[u8]) -> redis::RedisResult<usize> {
        let mut conn = self.conn.lock().await.clone();
        conn.publish(topic, payload).await
    }
}

#[async_trait]
impl PubSubBroker for RedisPubSub {
    async fn publish(&self, topic: &str, payload: &[u8]) -> HubResult<usize> {
        match self.publish_once(topic, payload).await {
            Ok(receivers) => Ok(receivers),
            Err(e) if e.is_io_error() || e.is_connection_dropped() => {
                warn!(topic, error = %e, "publish failed, reconnecting");
                let fresh = self.client.get_multiplexed_async_connection().await?;
                *self.conn.lock().await = fresh;
                Ok(self.publish_once(topic, payload).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn subscribe(&self, topic: &str) -> HubResult<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        debug!(topic, "subscribed to redis topic");

        let messages = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());

        Ok(messages.boxed())
    }
}
