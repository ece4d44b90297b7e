//! Where reconnecting producers and consumers get their connections from.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::connection::PooledConnection;
use crate::error::{PoolError, PoolResult};
use crate::event::ConnectionEvent;
use crate::pool::ConnectionPool;

/// A single connection or a whole pool.
///
/// Bound to a single connection, a producer or consumer waits for that
/// connection to resume after an interruption. Bound to a pool, it moves to
/// whichever connection the pool hands out next.
#[derive(Debug, Clone)]
pub enum ConnectionSource {
    /// Always use this connection.
    Single(Arc<PooledConnection>),
    /// Pick connections from the pool.
    Pool(ConnectionPool),
}

impl ConnectionSource {
    /// Subscribes to the events relevant to this source.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        match self {
            Self::Single(connection) => connection.subscribe(),
            Self::Pool(pool) => pool.subscribe(),
        }
    }

    /// Returns a connection to bind to.
    pub fn acquire(&self) -> PoolResult<Arc<PooledConnection>> {
        match self {
            Self::Single(connection) if connection.is_destroyed() => {
                Err(PoolError::ConnectionDestroyed {
                    connection_id: connection.id(),
                })
            }
            Self::Single(connection) => Ok(connection.clone()),
            Self::Pool(pool) => pool.get_connection(),
        }
    }
}

impl From<Arc<PooledConnection>> for ConnectionSource {
    fn from(connection: Arc<PooledConnection>) -> Self {
        Self::Single(connection)
    }
}

impl From<ConnectionPool> for ConnectionSource {
    fn from(pool: ConnectionPool) -> Self {
        Self::Pool(pool)
    }
}

impl From<&ConnectionPool> for ConnectionSource {
    fn from(pool: &ConnectionPool) -> Self {
        Self::Pool(pool.clone())
    }
}
