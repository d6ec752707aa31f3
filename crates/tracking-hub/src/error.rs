//! Error types for the tracking hub.

use thiserror::Error;

/// Tracking hub error type.
#[derive(Error, Debug)]
pub enum HubError {
    /// Broker rejected or could not carry a publish/subscribe
    #[error("Broker error: {0}")]
    Broker(String),

    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Event could not be serialized for publishing
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The registry has been shut down and accepts no new subscribers
    #[error("Registry is shutting down")]
    ShuttingDown,

    /// The connection was already closed before it could be subscribed
    #[error("Connection already closed")]
    ConnectionClosed,
}

/// Result type for tracking hub operations.
pub type HubResult<T> = Result<T, HubError>;
