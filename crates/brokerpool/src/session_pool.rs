//! Per-connection session pool.
//!
//! Sessions are borrowed and returned; connections never are. The pool keeps
//! an idle queue and an in-use map under one lock so that moving a session
//! between them is atomic. New sessions are created outside the lock; a
//! reservation counter keeps concurrent borrowers from overshooting the
//! maximum while they wait on the broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use brokerpool_traits::{AcknowledgementMode, BrokerConnection};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{PoolError, PoolResult};
use crate::session::Session;
use crate::settings::PoolSettings;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Sizing and mode of a [`SessionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPoolConfig {
    /// Sessions created by [`SessionPool::start`].
    pub min_sessions: usize,
    /// Upper bound on idle plus borrowed sessions.
    pub max_sessions: usize,
    /// Whether borrowing may create sessions beyond the idle ones.
    pub auto_grow: bool,
    /// Acknowledgement mode of every pooled session.
    pub acknowledgement_mode: AcknowledgementMode,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 10,
            max_sessions: 50,
            auto_grow: true,
            acknowledgement_mode: AcknowledgementMode::AutoAcknowledge,
        }
    }
}

impl From<&PoolSettings> for SessionPoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            min_sessions: settings.min_sessions_per_connection,
            max_sessions: settings.max_sessions_per_connection,
            auto_grow: settings.auto_grow_sessions,
            acknowledgement_mode: settings.acknowledgement_mode,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<Arc<Session>>,
    in_use: HashMap<u64, Arc<Session>>,
    creating: usize,
    stopped: bool,
}

/// Bounded, growable set of sessions on one connection.
#[derive(Debug)]
pub struct SessionPool {
    id: u64,
    connection_id: u64,
    connection: Arc<dyn BrokerConnection>,
    config: SessionPoolConfig,
    state: Mutex<PoolState>,
}

// Releases a creation slot even if the borrowing future is dropped mid-await.
struct Reservation<'a> {
    state: &'a Mutex<PoolState>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.state.lock().creating -= 1;
    }
}

impl SessionPool {
    /// Creates an empty pool for `connection`. Call [`start`](Self::start)
    /// once the connection itself has started.
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        connection_id: u64,
        config: SessionPoolConfig,
    ) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            connection_id,
            connection,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Process-unique pool id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The pool's configuration.
    pub fn config(&self) -> &SessionPoolConfig {
        &self.config
    }

    /// Creates the configured minimum number of idle sessions.
    pub async fn start(&self) -> PoolResult<()> {
        for _ in 0..self.config.min_sessions {
            let session = Arc::new(self.create().await?);
            let stopped = {
                let mut state = self.state.lock();
                if !state.stopped {
                    state.idle.push_back(session.clone());
                }
                state.stopped
            };
            if stopped {
                session.destroy().await;
                return Err(PoolError::Closed("session pool".into()));
            }
        }
        debug!(
            pool_id = self.id,
            connection_id = self.connection_id,
            sessions = self.config.min_sessions,
            "Session pool started"
        );
        Ok(())
    }

    /// Borrows a session.
    ///
    /// Takes an idle session if there is one. Otherwise creates a new session
    /// when growth is enabled and fewer than the maximum are borrowed, and
    /// fails with [`PoolError::PoolExhausted`] when neither is possible.
    pub async fn borrow(&self) -> PoolResult<Arc<Session>> {
        let reservation = {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(PoolError::Closed("session pool".into()));
            }
            if let Some(session) = state.idle.pop_front() {
                state.in_use.insert(session.id(), session.clone());
                trace!(pool_id = self.id, session_id = session.id(), "Borrowed idle session");
                return Ok(session);
            }
            if !self.config.auto_grow
                || state.in_use.len() + state.creating >= self.config.max_sessions
            {
                return Err(PoolError::PoolExhausted {
                    connection_id: self.connection_id,
                    max: self.config.max_sessions,
                });
            }
            state.creating += 1;
            Reservation { state: &self.state }
        };

        let session = Arc::new(self.create().await?);
        let stopped = {
            let mut state = self.state.lock();
            if !state.stopped {
                state.in_use.insert(session.id(), session.clone());
            }
            state.stopped
        };
        drop(reservation);
        if stopped {
            session.destroy().await;
            return Err(PoolError::Closed("session pool".into()));
        }
        debug!(pool_id = self.id, session_id = session.id(), "Grew session pool");
        Ok(session)
    }

    /// Returns a borrowed session to the idle queue.
    ///
    /// Fails with [`PoolError::ForeignSession`] if the session was not lent by
    /// this pool. Returning after the pool stopped is accepted and ignored.
    pub fn return_session(&self, session: Arc<Session>) -> PoolResult<()> {
        if session.pool_id() != Some(self.id) {
            return Err(PoolError::ForeignSession {
                session_id: session.id(),
            });
        }
        let mut state = self.state.lock();
        if state.stopped {
            return Ok(());
        }
        match state.in_use.remove(&session.id()) {
            Some(session) if !session.is_destroyed() => {
                state.idle.push_back(session);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(PoolError::ForeignSession {
                session_id: session.id(),
            }),
        }
    }

    /// Drops a borrowed session from the pool and destroys it.
    pub async fn discard(&self, session: Arc<Session>) -> PoolResult<()> {
        if session.pool_id() != Some(self.id) {
            return Err(PoolError::ForeignSession {
                session_id: session.id(),
            });
        }
        self.state.lock().in_use.remove(&session.id());
        session.destroy().await;
        Ok(())
    }

    /// Destroys every idle and borrowed session.
    ///
    /// Borrowed sessions are destroyed in place; their holders get
    /// [`PoolError::SessionClosed`] on next use.
    pub async fn stop(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.state.lock();
            state.stopped = true;
            let idle = std::mem::take(&mut state.idle);
            let in_use = std::mem::take(&mut state.in_use);
            idle.into_iter().chain(in_use.into_values()).collect()
        };
        let count = sessions.len();
        for session in sessions {
            session.destroy().await;
        }
        debug!(pool_id = self.id, connection_id = self.connection_id, count, "Session pool stopped");
    }

    /// Number of idle sessions.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Number of borrowed sessions.
    pub fn in_use_count(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Idle plus borrowed sessions.
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.idle.len() + state.in_use.len()
    }

    /// Returns `true` once [`stop`](Self::stop) has run.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    async fn create(&self) -> PoolResult<Session> {
        let raw = self
            .connection
            .create_session(self.config.acknowledgement_mode)
            .await?;
        Ok(Session::new(raw, self.connection_id, Some(self.id)))
    }
}
