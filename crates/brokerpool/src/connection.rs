//! Pooled broker connections.
//!
//! A [`PooledConnection`] owns one raw broker connection and the
//! [`SessionPool`] on top of it. It turns the broker client's interruption,
//! resumption and exception signals into [`ConnectionEvent`]s and tracks its
//! own lifecycle:
//!
//! ```text
//! Starting ──► Up ◄──► Interrupted
//!               │           │
//!               └──► Destroyed ◄┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use brokerpool_traits::{
    AcknowledgementMode, BrokerConnection, BrokerConnector, ConnectionSignal,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{PoolError, PoolResult};
use crate::event::{ConnectionEvent, EventEmitter};
use crate::session::Session;
use crate::session_pool::{SessionPool, SessionPoolConfig};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`PooledConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opened, not yet started.
    Starting,
    /// Started and carrying traffic.
    Up,
    /// Interrupted or failed; may resume.
    Interrupted,
    /// Torn down for good.
    Destroyed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Up => write!(f, "up"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// One broker connection together with its session pool.
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    endpoint: Endpoint,
    raw: Arc<dyn BrokerConnection>,
    sessions: SessionPool,
    state: RwLock<ConnectionState>,
    events: EventEmitter,
    watcher: Mutex<Option<JoinHandle<()>>>,
    teardown: tokio::sync::Mutex<()>,
}

impl PooledConnection {
    /// Opens a connection to `endpoint` without starting it.
    ///
    /// Subscribe to [`events`](Self::subscribe) before calling
    /// [`start`](Self::start) to observe everything the connection reports.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        endpoint: Endpoint,
        config: SessionPoolConfig,
    ) -> PoolResult<Arc<Self>> {
        let raw = connector
            .connect(endpoint.uri(), endpoint.credentials.as_ref())
            .await?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Self {
            id,
            sessions: SessionPool::new(raw.clone(), id, config),
            endpoint,
            raw,
            state: RwLock::new(ConnectionState::Starting),
            events: EventEmitter::new(),
            watcher: Mutex::new(None),
            teardown: tokio::sync::Mutex::new(()),
        });
        connection.spawn_watcher();
        debug!(connection_id = id, endpoint = %connection.endpoint, "Connection opened");
        Ok(connection)
    }

    /// Opens and starts a standalone connection.
    pub async fn open(
        connector: &dyn BrokerConnector,
        endpoint: Endpoint,
        config: SessionPoolConfig,
    ) -> PoolResult<Arc<Self>> {
        let connection = Self::connect(connector, endpoint, config).await?;
        if let Err(e) = connection.start().await {
            let _ = connection.destroy().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Starts the raw connection, then fills the session pool.
    pub async fn start(&self) -> PoolResult<()> {
        if self.is_destroyed() {
            return Err(PoolError::ConnectionDestroyed {
                connection_id: self.id,
            });
        }
        self.raw.start().await?;
        self.sessions.start().await?;
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Starting {
                *state = ConnectionState::Up;
            }
        }
        info!(connection_id = self.id, endpoint = %self.endpoint, "Connection started");
        Ok(())
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The endpoint the connection was opened against.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Returns `true` while the connection is up.
    pub fn is_up(&self) -> bool {
        self.state() == ConnectionState::Up
    }

    /// Returns `true` once the connection has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.state() == ConnectionState::Destroyed
    }

    /// Acknowledgement mode of the pooled sessions.
    pub fn acknowledgement_mode(&self) -> AcknowledgementMode {
        self.sessions.config().acknowledgement_mode
    }

    /// The connection's session pool.
    pub fn session_pool(&self) -> &SessionPool {
        &self.sessions
    }

    /// The underlying broker connection.
    pub fn raw(&self) -> &Arc<dyn BrokerConnection> {
        &self.raw
    }

    /// Subscribes to this connection's events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Creates a session.
    ///
    /// A session in the pool's acknowledgement mode is borrowed from the
    /// session pool. Any other mode gets a one-off unpooled session that the
    /// caller owns.
    pub async fn create_session(&self, mode: AcknowledgementMode) -> PoolResult<Arc<Session>> {
        if self.is_destroyed() {
            return Err(PoolError::ConnectionDestroyed {
                connection_id: self.id,
            });
        }
        if mode == self.acknowledgement_mode() {
            return self.sessions.borrow().await;
        }
        let raw = self.raw.create_session(mode).await?;
        let session = Session::new(raw, self.id, None);
        debug!(connection_id = self.id, session_id = session.id(), %mode, "Created unpooled session");
        Ok(Arc::new(session))
    }

    /// Hands a session back: pooled sessions return to the pool, unpooled
    /// ones are destroyed.
    pub async fn release_session(&self, session: Arc<Session>) -> PoolResult<()> {
        if session.is_pooled() {
            self.sessions.return_session(session)
        } else {
            session.destroy().await;
            Ok(())
        }
    }

    /// Destroys a session that may be broken, freeing its pool slot.
    pub async fn discard_session(&self, session: Arc<Session>) -> PoolResult<()> {
        if session.is_pooled() {
            self.sessions.discard(session).await
        } else {
            session.destroy().await;
            Ok(())
        }
    }

    /// Stops the session pool, then stops and closes the raw connection.
    ///
    /// Destroying twice is a no-op. If closing fails the connection stays
    /// undestroyed so a later call can try again. A successful teardown emits
    /// [`ConnectionEvent::Destroyed`] so that producers and consumers bound to
    /// the connection let go of it.
    pub async fn destroy(self: &Arc<Self>) -> PoolResult<()> {
        let _guard = self.teardown.lock().await;
        if self.is_destroyed() {
            return Ok(());
        }

        self.sessions.stop().await;
        if let Err(e) = self.raw.stop().await {
            debug!(connection_id = self.id, error = %e, "Failed to stop connection");
        }
        self.raw.close().await?;

        *self.state.write() = ConnectionState::Destroyed;
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        info!(connection_id = self.id, endpoint = %self.endpoint, "Connection destroyed");
        self.events.emit_destroyed(self.clone());
        Ok(())
    }

    fn spawn_watcher(self: &Arc<Self>) {
        let mut signals = self.raw.subscribe();
        let connection = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let signal = match signals.recv().await {
                    Ok(signal) => signal,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Connection signal listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                connection.on_signal(signal);
            }
        });
        *self.watcher.lock() = Some(handle);
    }

    fn on_signal(self: &Arc<Self>, signal: ConnectionSignal) {
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Destroyed {
                return;
            }
            *state = match signal {
                ConnectionSignal::Resumed => ConnectionState::Up,
                ConnectionSignal::Interrupted | ConnectionSignal::Exception(_) => {
                    ConnectionState::Interrupted
                }
            };
        }

        match signal {
            ConnectionSignal::Interrupted => {
                warn!(connection_id = self.id, endpoint = %self.endpoint, "Connection interrupted");
                self.events.emit_interrupted(self.clone());
            }
            ConnectionSignal::Resumed => {
                info!(connection_id = self.id, endpoint = %self.endpoint, "Connection resumed");
                self.events.emit_resumed(self.clone());
            }
            ConnectionSignal::Exception(cause) => {
                error!(connection_id = self.id, endpoint = %self.endpoint, error = %cause, "Connection exception");
                self.events.emit_exception(self.clone(), cause);
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerpool_memory::{MemoryBroker, MemoryConnector};
    use brokerpool_traits::BrokerError;
    use std::time::Duration;

    fn config() -> SessionPoolConfig {
        SessionPoolConfig {
            min_sessions: 2,
            max_sessions: 4,
            ..SessionPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_fills_session_pool() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        let connection = PooledConnection::connect(&connector, Endpoint::new("memory://a"), config())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Starting);
        assert_eq!(connection.session_pool().idle_count(), 0);

        connection.start().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Up);
        assert_eq!(connection.session_pool().idle_count(), 2);
        assert!(connection.raw().is_started());
    }

    #[tokio::test]
    async fn test_session_mode_selects_pooled_or_unpooled() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        let connection = PooledConnection::open(&connector, Endpoint::new("memory://a"), config())
            .await
            .unwrap();

        let pooled = connection
            .create_session(AcknowledgementMode::AutoAcknowledge)
            .await
            .unwrap();
        assert!(pooled.is_pooled());
        assert_eq!(connection.session_pool().in_use_count(), 1);

        let unpooled = connection
            .create_session(AcknowledgementMode::ClientAcknowledge)
            .await
            .unwrap();
        assert!(!unpooled.is_pooled());
        assert_eq!(
            unpooled.acknowledgement_mode(),
            AcknowledgementMode::ClientAcknowledge
        );
        assert_eq!(connection.session_pool().in_use_count(), 1);

        connection.release_session(unpooled.clone()).await.unwrap();
        assert!(unpooled.is_destroyed());
        connection.release_session(pooled).await.unwrap();
        assert_eq!(connection.session_pool().idle_count(), 2);
    }

    #[tokio::test]
    async fn test_destroy_twice_is_noop() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        let connection = PooledConnection::open(&connector, Endpoint::new("memory://a"), config())
            .await
            .unwrap();
        let session = connection
            .create_session(AcknowledgementMode::AutoAcknowledge)
            .await
            .unwrap();

        let mut events = connection.subscribe();
        connection.destroy().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Destroyed);
        assert!(session.is_destroyed());
        assert!(matches!(events.try_recv(), Ok(ConnectionEvent::Destroyed(_))));
        assert!(connector.connections().is_empty());

        connection.destroy().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Destroyed);
        assert!(events.try_recv().is_err());
        assert!(matches!(
            connection
                .create_session(AcknowledgementMode::AutoAcknowledge)
                .await,
            Err(PoolError::ConnectionDestroyed { .. })
        ));
    }

    #[tokio::test]
    async fn test_signals_become_events() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        let connection = PooledConnection::open(&connector, Endpoint::new("memory://a"), config())
            .await
            .unwrap();
        let mut events = connection.subscribe();
        let memory = connector.connections().remove(0);

        memory.interrupt();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ConnectionEvent::Interrupted(_)));
        assert_eq!(event.connection_id(), connection.id());
        assert_eq!(connection.state(), ConnectionState::Interrupted);

        memory.resume();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ConnectionEvent::Resumed(_)));
        assert!(connection.is_up());

        memory.raise_exception(BrokerError::ConnectionLost("reset".into()));
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_failure());
        assert_eq!(connection.state(), ConnectionState::Interrupted);
    }
}
