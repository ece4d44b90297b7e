//! Several identical consumers on one destination.

use std::time::Duration;

use brokerpool_traits::Destination;
use futures::future::join_all;
use tracing::debug;

use crate::consumer::{ConsumerMode, ReconnectingConsumer};
use crate::error::{PoolError, PoolResult};
use crate::source::ConnectionSource;

/// `count` reconnecting consumers sharing a destination, selector and mode.
///
/// On a queue the members compete for messages, which spreads processing
/// over as many sessions.
#[derive(Debug)]
pub struct MultiConsumer {
    consumers: Vec<ReconnectingConsumer>,
}

impl MultiConsumer {
    /// Creates `count` consumers. Fails if `count` is zero.
    pub async fn new(
        source: impl Into<ConnectionSource>,
        destination: Destination,
        selector: Option<String>,
        mode: ConsumerMode,
        count: usize,
    ) -> PoolResult<Self> {
        if count == 0 {
            return Err(PoolError::Configuration(
                "a multi-consumer needs at least one consumer".to_string(),
            ));
        }
        let source = source.into();
        let consumers = join_all((0..count).map(|_| {
            ReconnectingConsumer::new(
                source.clone(),
                destination.clone(),
                selector.clone(),
                mode.clone(),
            )
        }))
        .await;
        debug!(%destination, count, "Multi-consumer created");
        Ok(Self { consumers })
    }

    /// Number of member consumers.
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    /// Always `false`; a multi-consumer has at least one member.
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// The member consumers.
    pub fn consumers(&self) -> &[ReconnectingConsumer] {
        &self.consumers
    }

    /// Number of members currently bound.
    pub fn ready_count(&self) -> usize {
        self.consumers.iter().filter(|c| c.is_ready()).count()
    }

    /// Waits until every member is bound, each for at most `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> PoolResult<()> {
        join_all(self.consumers.iter().map(|c| c.wait_ready(timeout)))
            .await
            .into_iter()
            .collect()
    }

    /// Closes every member.
    pub async fn close(&self) {
        join_all(self.consumers.iter().map(ReconnectingConsumer::close)).await;
    }
}
