//! Connection lifecycle events.

use std::sync::Arc;

use brokerpool_traits::BrokerError;
use tokio::sync::broadcast;

use crate::connection::PooledConnection;

const EVENT_CAPACITY: usize = 256;

/// A state transition of a pooled connection.
///
/// Each connection publishes its own events from a single task, so for any
/// one connection an `Interrupted` is always delivered before the `Resumed`
/// that follows it.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection stopped carrying traffic.
    Interrupted(Arc<PooledConnection>),
    /// The connection is usable again, or was just established.
    Resumed(Arc<PooledConnection>),
    /// The connection reported an error and is treated as down.
    Exception {
        /// The failing connection.
        connection: Arc<PooledConnection>,
        /// The reported error.
        error: BrokerError,
    },
    /// A new connection joined the pool.
    Available(Arc<PooledConnection>),
    /// The connection was torn down and will never carry traffic again.
    Destroyed(Arc<PooledConnection>),
}

impl ConnectionEvent {
    /// The connection the event is about.
    pub fn connection(&self) -> &Arc<PooledConnection> {
        match self {
            Self::Interrupted(connection)
            | Self::Resumed(connection)
            | Self::Available(connection)
            | Self::Destroyed(connection)
            | Self::Exception { connection, .. } => connection,
        }
    }

    /// Id of the connection the event is about.
    pub fn connection_id(&self) -> u64 {
        self.connection().id()
    }

    /// Returns `true` for events after which the connection is down.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Interrupted(_) | Self::Exception { .. } | Self::Destroyed(_)
        )
    }
}

/// Broadcasts [`ConnectionEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl EventEmitter {
    /// Creates an emitter with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribes to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    /// Emits an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.sender.send(event);
    }

    /// Emits an `Interrupted` event.
    pub fn emit_interrupted(&self, connection: Arc<PooledConnection>) {
        self.emit(ConnectionEvent::Interrupted(connection));
    }

    /// Emits a `Resumed` event.
    pub fn emit_resumed(&self, connection: Arc<PooledConnection>) {
        self.emit(ConnectionEvent::Resumed(connection));
    }

    /// Emits an `Exception` event.
    pub fn emit_exception(&self, connection: Arc<PooledConnection>, error: BrokerError) {
        self.emit(ConnectionEvent::Exception { connection, error });
    }

    /// Emits an `Available` event.
    pub fn emit_available(&self, connection: Arc<PooledConnection>) {
        self.emit(ConnectionEvent::Available(connection));
    }

    /// Emits a `Destroyed` event.
    pub fn emit_destroyed(&self, connection: Arc<PooledConnection>) {
        self.emit(ConnectionEvent::Destroyed(connection));
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
