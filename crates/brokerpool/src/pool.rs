//! Multi-endpoint connection pool.
//!
//! The pool keeps `connection_count` connections up across the endpoints of an
//! [`EndpointRegistry`], repairing itself with three background loops:
//!
//! - **recovery** (default every 1s) starts as many new connection attempts as
//!   the pool is short, counting attempts already in flight;
//! - **cleanup** (default every 5s) destroys connections that failed, keeping
//!   any whose teardown errors for the next pass;
//! - **status** (default every 30s) logs how many connections are up.
//!
//! Connections are *selected* round-robin, never borrowed: many callers share
//! a connection and borrow sessions from it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use brokerpool_traits::BrokerConnector;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connection::PooledConnection;
use crate::endpoint::Endpoint;
use crate::error::{PoolError, PoolResult};
use crate::event::{ConnectionEvent, EventEmitter};
use crate::registry::{EndpointRegistry, EndpointStrategies};
use crate::session_pool::SessionPoolConfig;
use crate::settings::PoolSettings;

/// A cloneable handle to a connection pool.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    settings: PoolSettings,
    connector: Arc<dyn BrokerConnector>,
    registry: Arc<dyn EndpointRegistry>,
    active: Mutex<ActiveConnections>,
    cleanup: Mutex<Vec<Arc<PooledConnection>>>,
    forwarders: Mutex<HashMap<u64, JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
    stopped: AtomicBool,
    pending: AtomicUsize,
    recovering: AtomicBool,
    cleaning: AtomicBool,
    available: Notify,
    events: EventEmitter,
    counters: PoolCounters,
}

#[derive(Debug, Default)]
struct ActiveConnections {
    list: Vec<Arc<PooledConnection>>,
    cursor: usize,
}

#[derive(Debug, Default)]
enum Lifecycle {
    #[default]
    Idle,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

#[derive(Debug, Default)]
struct PoolCounters {
    attempts: AtomicU64,
    failures: AtomicU64,
    interruptions: AtomicU64,
    resumptions: AtomicU64,
    destroyed: AtomicU64,
}

/// Cumulative pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connection attempts started.
    pub connection_attempts: u64,
    /// Connection attempts that failed.
    pub connection_failures: u64,
    /// Interruption or exception events seen.
    pub interruptions: u64,
    /// Resumption events seen.
    pub resumptions: u64,
    /// Connections destroyed by cleanup.
    pub connections_destroyed: u64,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Configured connection count.
    pub target: usize,
    /// Connections currently up.
    pub up: usize,
    /// Connection attempts in flight.
    pub pending: usize,
    /// Failed connections waiting to be destroyed.
    pub awaiting_cleanup: usize,
    /// Up connections per endpoint, in first-seen order.
    pub endpoints: Vec<(String, usize)>,
}

impl PoolStatus {
    /// Connections short of the target.
    pub fn down(&self) -> usize {
        self.target.saturating_sub(self.up)
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connections UP: {}, DOWN: {}", self.up, self.down())?;
        if !self.endpoints.is_empty() {
            let per_endpoint: Vec<String> = self
                .endpoints
                .iter()
                .map(|(uri, count)| format!("{uri} ({count})"))
                .collect();
            write!(f, " ({})", per_endpoint.join(", "))?;
        }
        Ok(())
    }
}

// Counts a connection attempt as pending from the moment it is scheduled until
// it finishes, however it finishes.
struct PendingAttempt {
    inner: Arc<PoolInner>,
}

impl PendingAttempt {
    fn reserve(inner: &Arc<PoolInner>) -> Self {
        inner.pending.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: inner.clone(),
        }
    }
}

impl Drop for PendingAttempt {
    fn drop(&mut self) {
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectionPool {
    /// Creates a pool using the built-in endpoint strategies.
    pub fn new(settings: PoolSettings, connector: Arc<dyn BrokerConnector>) -> PoolResult<Self> {
        Self::with_strategies(settings, connector, &EndpointStrategies::default())
    }

    /// Creates a pool, looking up `settings.endpoint_strategy` in `strategies`.
    pub fn with_strategies(
        settings: PoolSettings,
        connector: Arc<dyn BrokerConnector>,
        strategies: &EndpointStrategies,
    ) -> PoolResult<Self> {
        settings.validate()?;
        let registry = strategies.create(&settings.endpoint_strategy, settings.endpoints.clone())?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                settings,
                connector,
                registry,
                active: Mutex::new(ActiveConnections::default()),
                cleanup: Mutex::new(Vec::new()),
                forwarders: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(Lifecycle::Idle),
                stopped: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                recovering: AtomicBool::new(false),
                cleaning: AtomicBool::new(false),
                available: Notify::new(),
                events: EventEmitter::new(),
                counters: PoolCounters::default(),
            }),
        })
    }

    /// Starts connecting in the background and returns immediately.
    ///
    /// Starting a running pool is a no-op; starting a stopped one fails with
    /// [`PoolError::Closed`]. Must be called from within a tokio runtime.
    pub fn start(&self) -> PoolResult<()> {
        let handle = Handle::try_current().map_err(|_| {
            PoolError::Configuration("ConnectionPool::start requires a tokio runtime".to_string())
        })?;

        let mut lifecycle = self.inner.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Stopped => return Err(PoolError::Closed("connection pool".to_string())),
            Lifecycle::Idle => {}
        }

        let settings = &self.inner.settings;
        info!(
            connections = settings.connection_count,
            endpoints = settings.endpoints.len(),
            strategy = %settings.endpoint_strategy,
            "Starting connection pool"
        );

        for _ in 0..settings.connection_count {
            let attempt = PendingAttempt::reserve(&self.inner);
            let inner = self.inner.clone();
            handle.spawn(async move {
                inner.new_connection(attempt).await;
            });
        }

        let weak = Arc::downgrade(&self.inner);
        let mut tasks = vec![
            handle.spawn(recovery_loop(weak.clone(), settings.recovery_interval)),
            handle.spawn(cleanup_loop(weak.clone(), settings.cleanup_interval)),
        ];
        if !settings.status_interval.is_zero() {
            tasks.push(handle.spawn(status_loop(weak, settings.status_interval)));
        }
        *lifecycle = Lifecycle::Running(tasks);
        Ok(())
    }

    /// Starts the pool and waits until at least one connection is up.
    ///
    /// If none comes up within `timeout` the pool is stopped again and
    /// [`PoolError::StartupTimeout`] is returned.
    pub async fn start_and_wait(&self, timeout: Duration) -> PoolResult<()> {
        self.start()?;
        let inner = &self.inner;
        let first_connection = async {
            loop {
                let notified = inner.available.notified();
                if inner.active_count() > 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(timeout, first_connection).await.is_err() {
            error!(?timeout, "No connection established during start");
            self.stop().await;
            return Err(PoolError::StartupTimeout { timeout });
        }
        Ok(())
    }

    /// Stops the background loops and destroys every connection.
    ///
    /// Sessions still borrowed from pooled connections are destroyed too.
    /// Stopping twice is a no-op.
    pub async fn stop(&self) {
        let tasks = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(tasks) => tasks,
                Lifecycle::Idle => Vec::new(),
                Lifecycle::Stopped => return,
            }
        };
        self.inner.stopped.store(true, Ordering::SeqCst);
        for task in tasks {
            task.abort();
        }

        let connections: Vec<Arc<PooledConnection>> = {
            let mut active = self.inner.active.lock();
            active.cursor = 0;
            let mut all = std::mem::take(&mut active.list);
            all.append(&mut self.inner.cleanup.lock());
            all
        };
        let forwarders: Vec<JoinHandle<()>> =
            self.inner.forwarders.lock().drain().map(|(_, task)| task).collect();
        for forwarder in forwarders {
            forwarder.abort();
        }
        for connection in connections {
            match connection.destroy().await {
                Ok(()) => self.inner.events.emit_destroyed(connection),
                Err(e) => {
                    warn!(connection_id = connection.id(), error = %e, "Failed to destroy connection during stop");
                }
            }
        }
        info!("Connection pool stopped");
    }

    /// Returns `true` between a successful [`start`](Self::start) and
    /// [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Picks the next up connection in round-robin order.
    pub fn get_connection(&self) -> PoolResult<Arc<PooledConnection>> {
        let mut active = self.inner.active.lock();
        if active.list.is_empty() {
            return Err(PoolError::NoConnectionsAvailable);
        }
        if active.cursor >= active.list.len() {
            active.cursor = 0;
        }
        let connection = active.list[active.cursor].clone();
        active.cursor = (active.cursor + 1) % active.list.len();
        Ok(connection)
    }

    /// Like [`get_connection`](Self::get_connection), polling until a
    /// connection is up or `timeout` elapses.
    pub async fn get_connection_timeout(
        &self,
        timeout: Duration,
    ) -> PoolResult<Arc<PooledConnection>> {
        let deadline = Instant::now() + timeout;
        let poll = self.inner.settings.connection_poll_interval;
        loop {
            match self.get_connection() {
                Ok(connection) => return Ok(connection),
                Err(PoolError::NoConnectionsAvailable) => {}
                Err(e) => return Err(e),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout { timeout });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Subscribes to events of every pooled connection.
    ///
    /// New connections produce `Resumed` followed by `Available`.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Adds (or re-validates) an endpoint.
    pub fn add_endpoint(&self, endpoint: Endpoint) {
        info!(%endpoint, "Adding endpoint");
        self.inner.registry.add(endpoint);
    }

    /// Stops using an endpoint for new connections. Existing connections to it
    /// are left alone.
    pub fn invalidate_endpoint(&self, endpoint: &Endpoint) {
        warn!(%endpoint, "Invalidating endpoint");
        self.inner.registry.invalidate(endpoint);
    }

    /// The endpoint registry.
    pub fn registry(&self) -> &Arc<dyn EndpointRegistry> {
        &self.inner.registry
    }

    /// The settings the pool was created with.
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Number of connections up.
    pub fn active_count(&self) -> usize {
        self.inner.active_count()
    }

    /// Number of connection attempts in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Snapshot of the up connections.
    pub fn connections(&self) -> Vec<Arc<PooledConnection>> {
        self.inner.active.lock().list.clone()
    }

    /// Current status.
    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Cumulative counters.
    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            connection_attempts: c.attempts.load(Ordering::Relaxed),
            connection_failures: c.failures.load(Ordering::Relaxed),
            interruptions: c.interruptions.load(Ordering::Relaxed),
            resumptions: c.resumptions.load(Ordering::Relaxed),
            connections_destroyed: c.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Runs one recovery pass now.
    ///
    /// Does nothing unless the pool is running and called from within a
    /// tokio runtime.
    pub fn recover_now(&self) {
        self.inner.recover();
    }

    /// Runs one cleanup pass now.
    pub async fn cleanup_now(&self) {
        self.inner.cleanup().await;
    }
}

impl PoolInner {
    fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    fn active_count(&self) -> usize {
        self.active.lock().list.len()
    }

    fn status(&self) -> PoolStatus {
        let active = self.active.lock();
        let mut endpoints: Vec<(String, usize)> = Vec::new();
        for connection in &active.list {
            let uri = connection.endpoint().uri();
            match endpoints.iter_mut().find(|(known, _)| known == uri) {
                Some((_, count)) => *count += 1,
                None => endpoints.push((uri.to_string(), 1)),
            }
        }
        PoolStatus {
            target: self.settings.connection_count,
            up: active.list.len(),
            pending: self.pending.load(Ordering::SeqCst),
            awaiting_cleanup: self.cleanup.lock().len(),
            endpoints,
        }
    }

    async fn new_connection(
        self: Arc<Self>,
        _attempt: PendingAttempt,
    ) -> Option<Arc<PooledConnection>> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let endpoint = match self.registry.next() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Cannot create connection");
                return None;
            }
        };

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let config = SessionPoolConfig::from(&self.settings);
        let connection =
            match PooledConnection::connect(self.connector.as_ref(), endpoint.clone(), config).await
            {
                Ok(connection) => connection,
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(%endpoint, error = %e, "Failed to create connection");
                    return None;
                }
            };

        let events = connection.subscribe();
        if let Err(e) = connection.start().await {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            error!(connection_id = connection.id(), %endpoint, error = %e, "Failed to start connection");
            let _ = connection.destroy().await;
            return None;
        }

        // Checked under the list lock so a concurrent stop() either drains this
        // connection or makes us drop it.
        let accepted = {
            let mut active = self.active.lock();
            let accepted = !self.stopped.load(Ordering::SeqCst);
            if accepted {
                active.list.push(connection.clone());
            }
            accepted
        };
        if !accepted {
            let _ = connection.destroy().await;
            return None;
        }

        let forwarder = tokio::spawn(forward_events(Arc::downgrade(&self), events));
        self.forwarders.lock().insert(connection.id(), forwarder);

        info!(connection_id = connection.id(), %endpoint, "Connection available");
        self.events.emit_resumed(connection.clone());
        self.events.emit_available(connection.clone());
        self.available.notify_waiters();
        Some(connection)
    }

    fn recover(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            debug!("No tokio runtime, skipping recovery pass");
            return;
        };
        if self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        let up = self.active_count();
        let pending = self.pending.load(Ordering::SeqCst);
        let deficit = self.settings.connection_count.saturating_sub(up + pending);
        if deficit > 0 {
            info!(deficit, up, pending, "Recovering connections");
            for _ in 0..deficit {
                let attempt = PendingAttempt::reserve(self);
                let inner = self.clone();
                handle.spawn(async move {
                    inner.new_connection(attempt).await;
                });
            }
        }
        self.recovering.store(false, Ordering::SeqCst);
    }

    async fn cleanup(&self) {
        if self.cleaning.swap(true, Ordering::SeqCst) {
            return;
        }
        let queued: Vec<u64> = self.cleanup.lock().iter().map(|c| c.id()).collect();
        for id in queued {
            // Connections that resumed since the pass began have left the queue.
            let still_queued = self.cleanup.lock().iter().find(|c| c.id() == id).cloned();
            let Some(connection) = still_queued else {
                debug!(connection_id = id, "Connection resumed, skipping cleanup");
                continue;
            };
            match connection.destroy().await {
                Ok(()) => {
                    self.cleanup.lock().retain(|c| c.id() != id);
                    self.active.lock().list.retain(|c| c.id() != id);
                    self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                    debug!(connection_id = id, "Cleaned up connection");
                }
                Err(e) => {
                    warn!(connection_id = id, error = %e, "Failed to clean up connection, will retry");
                }
            }
        }
        self.cleaning.store(false, Ordering::SeqCst);
    }

    fn handle_event(&self, event: ConnectionEvent) {
        let connection = event.connection().clone();
        let id = connection.id();
        match &event {
            ConnectionEvent::Interrupted(_) | ConnectionEvent::Exception { .. } => {
                if connection.is_destroyed() {
                    return;
                }
                self.counters.interruptions.fetch_add(1, Ordering::Relaxed);
                self.active.lock().list.retain(|c| c.id() != id);
                let mut cleanup = self.cleanup.lock();
                if !cleanup.iter().any(|c| c.id() == id) {
                    cleanup.push(connection);
                }
                warn!(connection_id = id, "Connection removed from pool");
            }
            ConnectionEvent::Resumed(_) => {
                if connection.is_destroyed() {
                    return;
                }
                self.counters.resumptions.fetch_add(1, Ordering::Relaxed);
                self.cleanup.lock().retain(|c| c.id() != id);
                {
                    let mut active = self.active.lock();
                    if !active.list.iter().any(|c| c.id() == id) {
                        active.list.push(connection);
                    }
                }
                self.available.notify_waiters();
                info!(connection_id = id, "Connection returned to pool");
            }
            ConnectionEvent::Destroyed(_) => {
                self.active.lock().list.retain(|c| c.id() != id);
                self.cleanup.lock().retain(|c| c.id() != id);
                // The forwarder delivering this event ends after it.
                self.forwarders.lock().remove(&id);
            }
            ConnectionEvent::Available(_) => {}
        }
        self.events.emit(event);
    }
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolInner")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn forward_events(pool: Weak<PoolInner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(pool) = pool.upgrade() else { break };
                let destroyed = matches!(event, ConnectionEvent::Destroyed(_));
                pool.handle_event(event);
                if destroyed {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Pool event forwarder lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn recovery_loop(pool: Weak<PoolInner>, period: Duration) {
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        let Some(pool) = pool.upgrade() else { break };
        pool.recover();
    }
}

async fn cleanup_loop(pool: Weak<PoolInner>, period: Duration) {
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        let Some(pool) = pool.upgrade() else { break };
        pool.cleanup().await;
    }
}

async fn status_loop(pool: Weak<PoolInner>, period: Duration) {
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        let Some(pool) = pool.upgrade() else { break };
        info!("{}", pool.status());
    }
}
