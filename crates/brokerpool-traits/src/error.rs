//! Broker client error types.

use thiserror::Error;

/// A specialized `Result` type for broker client operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Errors reported by a broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BrokerError {
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost or is currently interrupted.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The broker rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The connection, session, producer or consumer has already been closed.
    #[error("{0} is closed")]
    Closed(String),

    /// Failed to send a message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A destination was required but none was given, or it does not exist.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// A message selector could not be parsed.
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Returns `true` if the error means the underlying connection is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ConnectionLost(_) | Self::AuthenticationFailed(_)
        )
    }

    /// Returns `true` if retrying the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::ConnectionLost(_))
    }
}
