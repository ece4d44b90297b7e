//! Common test utilities for integration tests
//!
//! Builds pools over the in-memory broker with short maintenance intervals
//! and provides polling helpers for the asynchronous recovery paths.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use brokerpool::{ConnectionPool, PoolSettings, PoolSettingsBuilder};
use brokerpool_memory::{MemoryBroker, MemoryConnection, MemoryConnector};

/// How long a test waits for an asynchronous condition before failing.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Settings with fast loops and a small session pool.
pub fn fast_settings(uris: &[&str], connections: usize) -> PoolSettingsBuilder {
    let mut builder = PoolSettings::builder()
        .connection_count(connections)
        .min_sessions(2)
        .max_sessions(8)
        .recovery_interval(Duration::from_millis(20))
        .cleanup_interval(Duration::from_millis(20))
        .status_interval(Duration::ZERO)
        .connection_poll_interval(Duration::from_millis(2))
        .producer_ready_timeout(Duration::from_secs(2));
    for uri in uris {
        builder = builder.endpoint(*uri);
    }
    builder
}

/// An in-memory broker and a connector bound to it.
pub fn memory() -> (MemoryBroker, MemoryConnector) {
    let broker = MemoryBroker::new();
    let connector = MemoryConnector::new(broker.clone());
    (broker, connector)
}

/// A pool over `connector` that is not started yet.
pub fn pool(connector: &MemoryConnector, settings: PoolSettings) -> ConnectionPool {
    ConnectionPool::new(settings, Arc::new(connector.clone())).expect("valid settings")
}

/// Polls `condition` until it holds or [`PATIENCE`] runs out.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// The single live memory connection.
pub fn only_connection(connector: &MemoryConnector) -> Arc<MemoryConnection> {
    let mut connections = connector.connections();
    assert_eq!(connections.len(), 1, "expected exactly one live connection");
    connections.remove(0)
}
