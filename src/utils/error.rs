//! The `error` module defines the error taxonomy used throughout `mmw`.
//!
//! Connection-level failures are retried internally by the connection manager
//! before they surface here; registry and lifecycle-ordering errors are
//! returned to the caller immediately.

use thiserror::Error;

/// Convenience alias used by the public API.
pub type Result<T> = std::result::Result<T, MmwError>;

/// Errors surfaced by the messaging session, handles and broker plumbing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MmwError {
    /// The broker endpoint is unreachable or the link broke. Retryable.
    #[error("broker link failed: {0}")]
    Connection(String),

    /// No publisher is registered for the topic. Caller error.
    #[error("no publisher registered for topic '{0}'")]
    UnknownTopic(String),

    /// The payload exceeds the configured maximum. Caller error.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The send queue is full. Retryable after a caller-defined delay.
    #[error("send queue is full")]
    Backpressure,

    /// `initialize` was called while a session is already live.
    #[error("messaging session is already initialized")]
    AlreadyInitialized,

    /// An operation was attempted on a session that was never initialized
    /// or has already been cleaned up.
    #[error("messaging session is not initialized")]
    NotInitialized,

    /// A reliable publish waited out its full budget without receiving a
    /// delivery report from the broker.
    #[error("no delivery report received within {waited_ms} ms")]
    DeliveryTimeout { waited_ms: u64 },

    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(String),

    /// A wire frame could not be decoded.
    #[error("malformed frame: {0}")]
    Frame(String),
}

impl From<config::ConfigError> for MmwError {
    fn from(err: config::ConfigError) -> Self {
        MmwError::Config(err.to_string())
    }
}

impl From<std::io::Error> for MmwError {
    fn from(err: std::io::Error) -> Self {
        MmwError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            MmwError::UnknownTopic("news".into()).to_string(),
            "no publisher registered for topic 'news'"
        );
        assert_eq!(
            MmwError::PayloadTooLarge { size: 2048, limit: 1024 }.to_string(),
            "payload of 2048 bytes exceeds the 1024 byte limit"
        );
        assert_eq!(MmwError::Backpressure.to_string(), "send queue is full");
    }

    #[test]
    fn io_error_converts_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: MmwError = io.into();
        assert!(matches!(err, MmwError::Connection(_)));
    }
}
