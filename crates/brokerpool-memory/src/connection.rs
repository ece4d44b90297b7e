//! In-memory connections with fault injection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use brokerpool_traits::{
    AcknowledgementMode, BrokerConnection, BrokerError, BrokerResult, BrokerSession,
    ConnectionSignal,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::broker::MemoryBroker;
use crate::session::MemorySession;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const SIGNAL_CAPACITY: usize = 64;

/// Shared liveness flags, consulted by the broker before every delivery.
#[derive(Debug, Default)]
pub(crate) struct ConnectionFlags {
    started: AtomicBool,
    interrupted: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionFlags {
    pub(crate) fn is_deliverable(&self) -> bool {
        self.started.load(Ordering::Acquire)
            && !self.interrupted.load(Ordering::Acquire)
            && !self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_usable(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("connection".into()));
        }
        if self.interrupted.load(Ordering::Acquire) {
            return Err(BrokerError::ConnectionLost("connection interrupted".into()));
        }
        Ok(())
    }
}

/// A connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    uri: String,
    broker: MemoryBroker,
    flags: Arc<ConnectionFlags>,
    signals: broadcast::Sender<ConnectionSignal>,
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    close_delay: Mutex<Option<Duration>>,
}

impl MemoryConnection {
    pub(crate) fn new(uri: &str, broker: MemoryBroker) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            uri: uri.to_string(),
            broker,
            flags: Arc::new(ConnectionFlags::default()),
            signals,
            sessions: Mutex::new(Vec::new()),
            close_delay: Mutex::new(None),
        }
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The endpoint this connection was opened against.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns `true` while the connection is interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.flags.interrupted.load(Ordering::Acquire)
    }

    /// Returns `true` once the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire)
    }

    /// Number of sessions created on this connection that are still open.
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|session| !session.is_closed())
            .count()
    }

    /// Simulates a transport failure: deliveries stop and sends fail until
    /// [`resume`](Self::resume) is called.
    pub fn interrupt(&self) {
        if self.is_closed() {
            return;
        }
        self.flags.interrupted.store(true, Ordering::Release);
        debug!(connection_id = self.id, uri = %self.uri, "memory connection interrupted");
        let _ = self.signals.send(ConnectionSignal::Interrupted);
    }

    /// Ends a simulated failure and redelivers buffered messages.
    pub fn resume(&self) {
        if self.is_closed() {
            return;
        }
        self.flags.interrupted.store(false, Ordering::Release);
        debug!(connection_id = self.id, uri = %self.uri, "memory connection resumed");
        let _ = self.signals.send(ConnectionSignal::Resumed);
        self.broker.flush();
    }

    /// Makes [`close`](BrokerConnection::close) wait `delay` before tearing
    /// anything down, simulating a slow broker handshake.
    pub fn set_close_delay(&self, delay: Option<Duration>) {
        *self.close_delay.lock() = delay;
    }

    /// Reports an asynchronous connection error to listeners.
    pub fn raise_exception(&self, error: BrokerError) {
        debug!(connection_id = self.id, uri = %self.uri, %error, "memory connection exception");
        let _ = self.signals.send(ConnectionSignal::Exception(error));
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn start(&self) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed("connection".into()));
        }
        self.flags.started.store(true, Ordering::Release);
        self.broker.flush();
        Ok(())
    }

    async fn stop(&self) -> BrokerResult<()> {
        self.flags.started.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        let delay = *self.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.flags.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flags.started.store(false, Ordering::Release);
        let sessions: Vec<_> = self.sessions.lock().drain(..).collect();
        for session in sessions {
            session.close_now();
        }
        self.broker.remove_owned(self.id);
        debug!(connection_id = self.id, uri = %self.uri, "memory connection closed");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.flags.started.load(Ordering::Acquire)
    }

    async fn create_session(
        &self,
        mode: AcknowledgementMode,
    ) -> BrokerResult<Arc<dyn BrokerSession>> {
        self.flags.ensure_usable()?;
        let session = Arc::new(MemorySession::new(
            self.id,
            mode,
            self.broker.clone(),
            self.flags.clone(),
        ));
        self.sessions.lock().push(session.clone());
        Ok(session)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }
}
