//! Owner of an application-wide pool.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use brokerpool_traits::BrokerConnector;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::PoolResult;
use crate::pool::ConnectionPool;
use crate::registry::EndpointStrategies;
use crate::settings::PoolSettings;

/// Holds at most one running [`ConnectionPool`] and serializes its start and
/// stop.
///
/// Applications that want a single shared pool create one host and pass it
/// (or the pool it returns) around explicitly.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use brokerpool::{PoolHost, PoolSettings};
/// # async fn run(connector: Arc<dyn brokerpool_traits::BrokerConnector>) -> brokerpool::PoolResult<()> {
/// let host = PoolHost::new(connector);
/// let settings = PoolSettings::builder().endpoint("memory://primary").build()?;
/// let pool = host.start(settings).await?;
/// // ...
/// host.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct PoolHost {
    connector: Arc<dyn BrokerConnector>,
    strategies: EndpointStrategies,
    pool: Mutex<Option<ConnectionPool>>,
}

impl PoolHost {
    /// Creates a host using the built-in endpoint strategies.
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self::with_strategies(connector, EndpointStrategies::default())
    }

    /// Creates a host with custom endpoint strategies.
    pub fn with_strategies(
        connector: Arc<dyn BrokerConnector>,
        strategies: EndpointStrategies,
    ) -> Self {
        Self {
            connector,
            strategies,
            pool: Mutex::new(None),
        }
    }

    /// Starts the pool, or returns the running one.
    ///
    /// While a pool is running, `settings` is ignored.
    pub async fn start(&self, settings: PoolSettings) -> PoolResult<ConnectionPool> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.as_ref() {
            debug!("Pool already running");
            return Ok(pool.clone());
        }
        let pool = ConnectionPool::with_strategies(
            settings,
            Arc::clone(&self.connector),
            &self.strategies,
        )?;
        pool.start()?;
        info!(
            connections = pool.settings().connection_count,
            "Pool host started"
        );
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// Like [`start`](Self::start), but waits up to `timeout` for the first
    /// connection. On timeout the pool is stopped and not kept.
    pub async fn start_and_wait(
        &self,
        settings: PoolSettings,
        timeout: Duration,
    ) -> PoolResult<ConnectionPool> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let pool = ConnectionPool::with_strategies(
            settings,
            Arc::clone(&self.connector),
            &self.strategies,
        )?;
        pool.start_and_wait(timeout).await?;
        info!(
            connections = pool.settings().connection_count,
            "Pool host started"
        );
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// The running pool, if any.
    pub async fn pool(&self) -> Option<ConnectionPool> {
        self.pool.lock().await.clone()
    }

    /// Returns `true` while a pool is running.
    pub async fn is_running(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    /// Stops the running pool. Returns `false` if there was none.
    ///
    /// A later [`start`](Self::start) creates a fresh pool.
    pub async fn stop(&self) -> bool {
        let mut slot = self.pool.lock().await;
        let Some(pool) = slot.take() else {
            return false;
        };
        pool.stop().await;
        info!("Pool host stopped");
        true
    }
}

impl fmt::Debug for PoolHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHost")
            .field("connector", &self.connector)
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}
