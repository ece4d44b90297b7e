//! Keeps a producer or consumer bound to a live connection.
//!
//! A [`Binder`] owns the current binding (session plus broker objects) of one
//! reconnecting client and reacts to connection events:
//!
//! - `Interrupted`/`Exception` on the bound connection: the binding is torn
//!   down, its session discarded, and a new binding is attempted right away
//!   against whatever the source hands out;
//! - `Resumed`/`Available` while unbound: bind to the signalling connection.
//!
//! Transitions are serialized; callers only ever see a complete binding or
//! none.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::PooledConnection;
use crate::error::{PoolError, PoolResult};
use crate::event::ConnectionEvent;
use crate::source::ConnectionSource;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Whether a reconnecting producer or consumer is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingState {
    /// Bound to a live connection.
    Initialized,
    /// Waiting for a connection to bind to.
    Uninitialized,
    /// Closed for good.
    Closed,
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[async_trait]
pub(crate) trait Binding: Send + Sync + 'static {
    fn connection(&self) -> &Arc<PooledConnection>;

    /// Closes the broker objects. `discard` destroys the session instead of
    /// returning it to its pool.
    async fn release(&self, discard: bool);
}

#[async_trait]
pub(crate) trait BindingFactory: Send + Sync + 'static {
    type Binding: Binding;

    async fn bind(&self, connection: Arc<PooledConnection>) -> PoolResult<Self::Binding>;
}

pub(crate) struct Binder<F: BindingFactory> {
    id: u64,
    kind: &'static str,
    factory: F,
    source: ConnectionSource,
    current: Mutex<Option<Arc<F::Binding>>>,
    ready: watch::Sender<bool>,
    transition: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl<F: BindingFactory> Binder<F> {
    /// Binds to the source if it has a connection, then follows its events.
    pub(crate) async fn start(
        kind: &'static str,
        factory: F,
        source: ConnectionSource,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (ready, _) = watch::channel(false);
        let binder = Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            factory,
            source,
            current: Mutex::new(None),
            ready,
            transition: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let events = binder.source.subscribe();
        match binder.source.acquire() {
            Ok(connection) => {
                binder.bind_to(connection).await;
            }
            Err(e) => {
                info!(kind, id = binder.id, error = %e, "No connection yet, waiting for one");
            }
        }
        let task = tokio::spawn(follow_events(Arc::downgrade(&binder), events));
        (binder, task)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> BindingState {
        if self.closed.load(Ordering::Acquire) {
            BindingState::Closed
        } else if self.current.lock().is_some() {
            BindingState::Initialized
        } else {
            BindingState::Uninitialized
        }
    }

    pub(crate) fn current(&self) -> Option<Arc<F::Binding>> {
        self.current.lock().clone()
    }

    pub(crate) fn connection_id(&self) -> Option<u64> {
        self.current.lock().as_ref().map(|b| b.connection().id())
    }

    /// Waits up to `timeout` for a binding.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> PoolResult<Arc<F::Binding>> {
        let mut changes = self.ready.subscribe();
        let wait = async {
            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Err(PoolError::Closed(self.kind.to_string()));
                }
                if let Some(binding) = self.current() {
                    return Ok(binding);
                }
                if changes.changed().await.is_err() {
                    return Err(PoolError::Closed(self.kind.to_string()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_else(|_| Err(PoolError::NotReady { timeout }))
    }

    async fn bind_to(&self, connection: Arc<PooledConnection>) -> bool {
        let _transition = self.transition.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if self.current.lock().is_some() {
            return true;
        }
        let connection_id = connection.id();
        match self.factory.bind(connection).await {
            Ok(binding) => {
                *self.current.lock() = Some(Arc::new(binding));
                self.ready.send_replace(true);
                info!(kind = self.kind, id = self.id, connection_id, "Bound to connection");
                true
            }
            Err(e) => {
                warn!(
                    kind = self.kind,
                    id = self.id,
                    connection_id,
                    error = %e,
                    "Failed to bind, waiting for a connection"
                );
                false
            }
        }
    }

    async fn unbind_from(&self, connection_id: u64) -> bool {
        let _transition = self.transition.lock().await;
        let stale = {
            let mut current = self.current.lock();
            let bound_here = current
                .as_ref()
                .is_some_and(|b| b.connection().id() == connection_id);
            if bound_here { current.take() } else { None }
        };
        let Some(stale) = stale else {
            return false;
        };
        self.ready.send_replace(false);
        warn!(kind = self.kind, id = self.id, connection_id, "Connection lost, unbinding");
        stale.release(true).await;
        true
    }

    async fn rebind(&self) {
        match self.source.acquire() {
            Ok(connection) => {
                self.bind_to(connection).await;
            }
            Err(e) => {
                debug!(kind = self.kind, id = self.id, error = %e, "Waiting for a connection to resume");
            }
        }
    }

    async fn handle(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Interrupted(connection)
            | ConnectionEvent::Exception { connection, .. }
            | ConnectionEvent::Destroyed(connection) => {
                if self.unbind_from(connection.id()).await {
                    self.rebind().await;
                }
            }
            ConnectionEvent::Resumed(connection) | ConnectionEvent::Available(connection) => {
                let stale = self
                    .current()
                    .map(|binding| binding.connection().clone())
                    .filter(|bound| bound.is_destroyed());
                if let Some(stale) = stale {
                    self.unbind_from(stale.id()).await;
                }
                if self.current().is_none() {
                    self.bind_to(connection).await;
                }
            }
        }
    }

    /// Releases the binding for good. Idempotent.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _transition = self.transition.lock().await;
        let binding = self.current.lock().take();
        self.ready.send_replace(false);
        if let Some(binding) = binding {
            binding.release(false).await;
        }
        debug!(kind = self.kind, id = self.id, "Closed");
    }
}

impl<F: BindingFactory> fmt::Debug for Binder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binder")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

async fn follow_events<F: BindingFactory>(
    binder: Weak<Binder<F>>,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed connection events");
                None
            }
            Err(RecvError::Closed) => break,
        };
        let Some(binder) = binder.upgrade() else {
            break;
        };
        if binder.closed.load(Ordering::Acquire) {
            break;
        }
        match event {
            Some(event) => binder.handle(event).await,
            None if binder.current().is_none() => binder.rebind().await,
            None => {}
        }
    }
}
