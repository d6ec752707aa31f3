//! Error types for the event pipeline.

use thiserror::Error;

/// Event pipeline error type.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Event could not be serialized for publishing
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue broker is unreachable or refused the operation
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker returned data in an unexpected shape
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl PipelineError {
    /// Whether the error came from the transport rather than the data.
    pub fn is_transport(&self) -> bool {
        matches!(self, PipelineError::Redis(_) | PipelineError::BrokerUnavailable(_))
    }
}

/// Result type for event pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_failures_are_transport_errors() {
        assert!(PipelineError::BrokerUnavailable("down".into()).is_transport());
        let io = redis::RedisError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(PipelineError::Redis(io).is_transport());

        assert!(!PipelineError::Protocol("bad reply".into()).is_transport());
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!PipelineError::Serialization(bad_json).is_transport());
    }
}
