//! Connection-level signals raised by a broker client.

use std::fmt;

use crate::error::BrokerError;

/// A change in the health of a broker connection.
///
/// Broker clients broadcast these from [`BrokerConnection::subscribe`]. A
/// single connection emits its signals in order, so an `Interrupted` is always
/// observed before the `Resumed` that follows it.
///
/// [`BrokerConnection::subscribe`]: crate::BrokerConnection::subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// Traffic on the connection stopped; it may come back.
    Interrupted,
    /// A previously interrupted connection is usable again.
    Resumed,
    /// The connection reported an error.
    Exception(BrokerError),
}

impl fmt::Display for ConnectionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "interrupted"),
            Self::Resumed => write!(f, "resumed"),
            Self::Exception(error) => write!(f, "exception: {error}"),
        }
    }
}
