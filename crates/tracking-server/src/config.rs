//! Server configuration.

use crate::error::{ServerError, ServerResult};
use event_pipeline::{RetryPolicy, DEFAULT_CLAIM_IDLE, DEFAULT_CONSUMER_GROUP};
use std::net::SocketAddr;
use std::time::Duration;
use tracking_hub::bridge::{BridgeConfig, DEFAULT_TOPIC_PREFIX};
use tracking_hub::connection::DEFAULT_OUTBOUND_CAPACITY;
use tracking_hub::heartbeat::{HeartbeatConfig, DEFAULT_HEARTBEAT_TIMEOUT};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_BLOCK_MS: u64 = 5_000;
pub const DEFAULT_MAIL_FROM: &str = "no-reply@tracking.local";
pub const DEFAULT_OPS_EMAIL: &str = "ops@tracking.local";

/// Runtime configuration for a tracking server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Redis connection URL. Without one the instance runs on in-memory
    /// brokers and cannot reach other instances.
    pub redis_url: Option<String>,
    /// Outbound frames buffered per viewer before new events are dropped.
    pub buffer_capacity: usize,
    pub heartbeat_timeout: Duration,
    pub topic_prefix: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub block_timeout: Duration,
    /// Unacknowledged queue entries idle this long are taken over by another
    /// consumer.
    pub claim_idle: Duration,
    /// Dead-letter cap. `None` keeps dead-lettering forever.
    pub max_retries: Option<u32>,
    pub mail_endpoint: Option<String>,
    pub mail_api_key: Option<String>,
    pub mail_from: String,
    pub ops_email: String,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> ServerResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unparseable numbers fall back to their defaults; an unparseable
    /// bind address is an error since there is nothing sensible to guess.
    pub fn from_lookup<F>(lookup: F) -> ServerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let bind_raw = var("TRACKING_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.parse().map_err(|e| {
            ServerError::Config(format!("invalid TRACKING_BIND_ADDR {bind_raw:?}: {e}"))
        })?;

        Ok(Self {
            bind_addr,
            redis_url: var("REDIS_URL"),
            buffer_capacity: var("TRACKING_BUFFER_CAPACITY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_OUTBOUND_CAPACITY),
            heartbeat_timeout: var("TRACKING_HEARTBEAT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT),
            topic_prefix: var("TRACKING_TOPIC_PREFIX")
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            consumer_group: var("TRACKING_CONSUMER_GROUP")
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            consumer_name: var("TRACKING_CONSUMER_NAME")
                .unwrap_or_else(|| format!("tracking-{}", uuid::Uuid::new_v4())),
            block_timeout: Duration::from_millis(
                var("TRACKING_BLOCK_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_BLOCK_MS),
            ),
            claim_idle: var("TRACKING_CLAIM_IDLE_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CLAIM_IDLE),
            max_retries: var("TRACKING_MAX_RETRIES").and_then(|v| v.parse().ok()),
            mail_endpoint: var("TRACKING_MAIL_ENDPOINT"),
            mail_api_key: var("TRACKING_MAIL_API_KEY"),
            mail_from: var("TRACKING_MAIL_FROM")
                .unwrap_or_else(|| DEFAULT_MAIL_FROM.to_string()),
            ops_email: var("TRACKING_OPS_EMAIL")
                .unwrap_or_else(|| DEFAULT_OPS_EMAIL.to_string()),
            log_level: var("TRACKING_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.buffer_capacity == 0 {
            return Err(ServerError::Config("buffer capacity must be at least 1".into()));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(ServerError::Config("heartbeat timeout must be positive".into()));
        }
        if self.consumer_group.is_empty() {
            return Err(ServerError::Config("consumer group must not be empty".into()));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::with_timeout(self.heartbeat_timeout)
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig::default().with_topic_prefix(self.topic_prefix.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self.max_retries {
            Some(max) => RetryPolicy::limited(max),
            None => RetryPolicy::unbounded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.redis_url, None);
        assert_eq!(config.buffer_capacity, 256);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.topic_prefix, "ws:delivery:");
        assert_eq!(config.consumer_group, "tracking");
        assert!(config.consumer_name.starts_with("tracking-"));
        assert_eq!(config.block_timeout, Duration::from_millis(5000));
        assert_eq!(config.claim_idle, Duration::from_secs(300));
        assert_eq!(config.max_retries, None);
        assert_eq!(config.mail_from, "no-reply@tracking.local");
        assert_eq!(config.ops_email, "ops@tracking.local");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("TRACKING_BIND_ADDR", "127.0.0.1:9000"),
            ("REDIS_URL", "redis://cache:6379"),
            ("TRACKING_BUFFER_CAPACITY", "8"),
            ("TRACKING_HEARTBEAT_TIMEOUT_SECS", "5"),
            ("TRACKING_TOPIC_PREFIX", "test:"),
            ("TRACKING_MAX_RETRIES", "3"),
            ("TRACKING_MAIL_ENDPOINT", "https://mail.example.com/send"),
            ("TRACKING_CLAIM_IDLE_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.buffer_capacity, 8);
        assert_eq!(config.heartbeat().timeout, Duration::from_secs(5));
        assert_eq!(config.bridge().topic_prefix, "test:");
        assert_eq!(config.retry_policy(), RetryPolicy::limited(3));
        assert_eq!(
            config.mail_endpoint.as_deref(),
            Some("https://mail.example.com/send")
        );
        assert_eq!(config.claim_idle, Duration::from_secs(60));
    }

    #[test]
    fn garbage_numbers_fall_back_and_blank_values_are_unset() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("TRACKING_BUFFER_CAPACITY", "lots"),
            ("TRACKING_MAX_RETRIES", "-1"),
            ("REDIS_URL", "  "),
        ]))
        .unwrap();

        assert_eq!(config.buffer_capacity, 256);
        assert_eq!(config.retry_policy(), RetryPolicy::unbounded());
        assert_eq!(config.redis_url, None);
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("TRACKING_BIND_ADDR", "not-an-addr")]))
            .unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn validate_rejects_zero_capacity_and_timeout() {
        let mut config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        config.buffer_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        config.heartbeat_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
