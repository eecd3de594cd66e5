//! Server error types.

use nmq_snowflake::SnowId;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] nmq_protocol::ProtocolError),

    #[error("id generator error: {0}")]
    Snowflake(#[from] nmq_snowflake::SnowflakeError),

    #[error("unsupported network: {0:?} (expected tcp, tcp4 or tcp6)")]
    UnsupportedNetwork(String),

    #[error("server already running")]
    AlreadyRunning,

    #[error("server not running")]
    NotRunning,

    #[error("connection {0} already registered")]
    DuplicateConnection(SnowId),

    #[error("connection {0} not found")]
    ConnectionNotFound(SnowId),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection limit reached ({max})")]
    ConnectionLimitReached { max: usize },

    #[error("server shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmq_protocol::ProtocolError;

    #[test]
    fn test_error_conversions() {
        let err: ServerError = ProtocolError::UnexpectedContinuation.into();
        assert!(matches!(err, ServerError::Protocol(_)));

        let err: ServerError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, ServerError::Io(_)));

        let err: ServerError = nmq_snowflake::SnowflakeError::Halted.into();
        assert!(matches!(err, ServerError::Snowflake(_)));
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::UnsupportedNetwork("udp".to_string());
        assert!(err.to_string().contains("udp"));

        let err = ServerError::ConnectionNotFound(SnowId::new(42));
        assert_eq!(err.to_string(), "connection 42 not found");
    }
}
