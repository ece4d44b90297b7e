//! Pooled and unpooled broker sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use brokerpool_traits::{
    AcknowledgementMode, BrokerConsumer, BrokerProducer, BrokerSession, Destination,
    MessageListener,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{PoolError, PoolResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A broker session handed out by a [`PooledConnection`](crate::PooledConnection).
///
/// Pooled sessions go back to their [`SessionPool`](crate::SessionPool) through
/// [`PooledConnection::release_session`](crate::PooledConnection::release_session).
/// Unpooled sessions, created for a non-default acknowledgement mode, belong
/// to the caller, who destroys them the same way.
///
/// Once the session is destroyed, either explicitly or because its pool was
/// stopped while it was borrowed, every operation fails with
/// [`PoolError::SessionClosed`].
#[derive(Debug)]
pub struct Session {
    id: u64,
    connection_id: u64,
    pool_id: Option<u64>,
    mode: AcknowledgementMode,
    raw: Arc<dyn BrokerSession>,
    destroyed: AtomicBool,
    temporary_queue: Mutex<Option<Destination>>,
}

impl Session {
    pub(crate) fn new(
        raw: Arc<dyn BrokerSession>,
        connection_id: u64,
        pool_id: Option<u64>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            connection_id,
            pool_id,
            mode: raw.acknowledgement_mode(),
            raw,
            destroyed: AtomicBool::new(false),
            temporary_queue: Mutex::new(None),
        }
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the connection the session was created on.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Acknowledgement mode of the session.
    pub fn acknowledgement_mode(&self) -> AcknowledgementMode {
        self.mode
    }

    /// Returns `true` if the session belongs to a session pool.
    pub fn is_pooled(&self) -> bool {
        self.pool_id.is_some()
    }

    pub(crate) fn pool_id(&self) -> Option<u64> {
        self.pool_id
    }

    /// Returns `true` once the session has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// The underlying broker session.
    pub fn raw(&self) -> PoolResult<&Arc<dyn BrokerSession>> {
        if self.is_destroyed() {
            return Err(PoolError::SessionClosed {
                session_id: self.id,
            });
        }
        Ok(&self.raw)
    }

    /// Creates a producer, optionally bound to a default destination.
    pub async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> PoolResult<Arc<dyn BrokerProducer>> {
        Ok(self.raw()?.create_producer(destination).await?)
    }

    /// Creates a consumer delivering to `listener`.
    pub async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        listener: MessageListener,
    ) -> PoolResult<Arc<dyn BrokerConsumer>> {
        Ok(self
            .raw()?
            .create_consumer(destination, selector, listener)
            .await?)
    }

    /// Returns the session's temporary queue, creating it on first use.
    ///
    /// The queue is deleted when the session is destroyed.
    pub async fn temporary_queue(&self) -> PoolResult<Destination> {
        let mut cached = self.temporary_queue.lock().await;
        if let Some(destination) = cached.as_ref() {
            return Ok(destination.clone());
        }
        let destination = self.raw()?.create_temporary_queue().await?;
        debug!(session_id = self.id, %destination, "Created temporary queue");
        *cached = Some(destination.clone());
        Ok(destination)
    }

    /// Closes the underlying session. Calling this twice is a no-op.
    pub(crate) async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(destination) = self.temporary_queue.lock().await.take() {
            if let Err(e) = self.raw.delete_temporary_queue(&destination).await {
                debug!(session_id = self.id, %destination, error = %e, "Failed to delete temporary queue");
            }
        }
        if let Err(e) = self.raw.close().await {
            warn!(session_id = self.id, error = %e, "Failed to close session");
        }
        debug!(session_id = self.id, connection_id = self.connection_id, "Session destroyed");
    }
}
