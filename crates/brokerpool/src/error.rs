//! Pool error types.

use std::time::Duration;

use brokerpool_traits::BrokerError;
use thiserror::Error;

/// A specialized `Result` type for pool operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the pooling layer.
///
/// Background maintenance (recovery, cleanup, rebinding) never returns these;
/// it logs and tries again on the next pass. Only foreground calls do.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolError {
    /// Every configured endpoint has been invalidated, or none was configured.
    #[error("No valid endpoints available")]
    NoEndpointsAvailable,

    /// The pool currently has no connection that is up.
    #[error("No connections available")]
    NoConnectionsAvailable,

    /// The session pool is at its limit and cannot grow.
    #[error("Maximum number of sessions ({max}) reached for connection {connection_id}")]
    PoolExhausted {
        /// The connection whose session pool is exhausted
        connection_id: u64,
        /// The configured maximum
        max: usize,
    },

    /// A session was returned to a pool that did not lend it.
    #[error("Session {session_id} does not belong to this pool")]
    ForeignSession {
        /// The id of the returned session
        session_id: u64,
    },

    /// No connection came up during a blocking start.
    #[error("No connection established within {timeout:?}")]
    StartupTimeout {
        /// The start timeout that elapsed
        timeout: Duration,
    },

    /// A bounded wait for a connection elapsed.
    #[error("No connection became available within {timeout:?}")]
    Timeout {
        /// The wait that elapsed
        timeout: Duration,
    },

    /// No reply arrived for a request.
    #[error("No response for correlation id {correlation_id} within {timeout:?}")]
    ResponseTimeout {
        /// The correlation id of the abandoned request
        correlation_id: String,
        /// The request timeout that elapsed
        timeout: Duration,
    },

    /// A producer was not bound to a live connection in time.
    #[error("Producer not ready within {timeout:?}")]
    NotReady {
        /// The readiness wait that elapsed
        timeout: Duration,
    },

    /// A session was used after its pool or connection destroyed it.
    #[error("Session {session_id} has been destroyed")]
    SessionClosed {
        /// The id of the destroyed session
        session_id: u64,
    },

    /// The connection has been destroyed.
    #[error("Connection {connection_id} has been destroyed")]
    ConnectionDestroyed {
        /// The id of the destroyed connection
        connection_id: u64,
    },

    /// The pool, producer or consumer was closed or stopped.
    #[error("{0} has been closed")]
    Closed(String),

    /// A correlation id was registered twice.
    #[error("Correlation id {0} is already pending")]
    DuplicateCorrelationId(String),

    /// Invalid settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An error reported by the broker client.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl PoolError {
    /// Returns `true` for any of the bounded-wait failures.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::StartupTimeout { .. }
                | Self::Timeout { .. }
                | Self::ResponseTimeout { .. }
                | Self::NotReady { .. }
        )
    }

    /// Returns `true` if retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoConnectionsAvailable
            | Self::PoolExhausted { .. }
            | Self::Timeout { .. }
            | Self::NotReady { .. } => true,
            Self::Broker(error) => error.is_retryable(),
            _ => false,
        }
    }
}
