//! Pool settings and their builder.
//!
//! Settings arrive already parsed: [`PoolSettings`] derives `Deserialize` with
//! per-field defaults, so any serde format works, or they can be assembled in
//! code with [`PoolSettingsBuilder`].

use std::time::Duration;

use brokerpool_traits::{AcknowledgementMode, Credentials};
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::{PoolError, PoolResult};
use crate::registry::EndpointStrategies;

/// Settings for a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of connections the pool tries to keep up.
    pub connection_count: usize,
    /// Sessions created on each connection when it starts.
    pub min_sessions_per_connection: usize,
    /// Upper bound on idle plus borrowed sessions per connection.
    pub max_sessions_per_connection: usize,
    /// Whether a connection may create sessions beyond the initial ones.
    pub auto_grow_sessions: bool,
    /// Acknowledgement mode of pooled sessions.
    pub acknowledgement_mode: AcknowledgementMode,
    /// Broker endpoints connections are spread across.
    pub endpoints: Vec<Endpoint>,
    /// Name of the endpoint selection strategy.
    pub endpoint_strategy: String,
    /// How often missing connections are recreated.
    pub recovery_interval: Duration,
    /// How often failed connections are destroyed.
    pub cleanup_interval: Duration,
    /// How often the pool status is logged. Zero disables the report.
    pub status_interval: Duration,
    /// Polling period of [`ConnectionPool::get_connection_timeout`](crate::ConnectionPool::get_connection_timeout).
    pub connection_poll_interval: Duration,
    /// How long a producer send waits for the producer to be bound.
    pub producer_ready_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connection_count: 1,
            min_sessions_per_connection: 10,
            max_sessions_per_connection: 50,
            auto_grow_sessions: true,
            acknowledgement_mode: AcknowledgementMode::AutoAcknowledge,
            endpoints: Vec::new(),
            endpoint_strategy: EndpointStrategies::ROUND_ROBIN.to_string(),
            recovery_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(30),
            connection_poll_interval: Duration::from_millis(5),
            producer_ready_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolSettings {
    /// Starts a builder from the defaults.
    #[must_use]
    pub fn builder() -> PoolSettingsBuilder {
        PoolSettingsBuilder::new()
    }

    /// Checks the settings for values the pool cannot run with.
    pub fn validate(&self) -> PoolResult<()> {
        if self.connection_count == 0 {
            return Err(PoolError::Configuration(
                "connection_count must be greater than 0".to_string(),
            ));
        }
        if self.max_sessions_per_connection == 0 {
            return Err(PoolError::Configuration(
                "max_sessions_per_connection must be greater than 0".to_string(),
            ));
        }
        if self.min_sessions_per_connection > self.max_sessions_per_connection {
            return Err(PoolError::Configuration(format!(
                "min_sessions_per_connection ({}) exceeds max_sessions_per_connection ({})",
                self.min_sessions_per_connection, self.max_sessions_per_connection
            )));
        }
        if self.endpoints.is_empty() {
            return Err(PoolError::Configuration(
                "at least one endpoint is required".to_string(),
            ));
        }
        for (name, interval) in [
            ("recovery_interval", self.recovery_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("connection_poll_interval", self.connection_poll_interval),
        ] {
            if interval.is_zero() {
                return Err(PoolError::Configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.endpoint_strategy.trim().is_empty() {
            return Err(PoolError::Configuration(
                "endpoint_strategy must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`PoolSettings`].
#[derive(Debug, Clone, Default)]
pub struct PoolSettingsBuilder {
    settings: PoolSettings,
}

impl PoolSettingsBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of pooled connections
    #[must_use]
    pub fn connection_count(mut self, count: usize) -> Self {
        self.settings.connection_count = count;
        self
    }

    /// Set the initial number of sessions per connection
    #[must_use]
    pub fn min_sessions(mut self, min: usize) -> Self {
        self.settings.min_sessions_per_connection = min;
        self
    }

    /// Set the session limit per connection
    #[must_use]
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.settings.max_sessions_per_connection = max;
        self
    }

    /// Enable or disable session growth beyond the initial count
    #[must_use]
    pub fn auto_grow_sessions(mut self, enabled: bool) -> Self {
        self.settings.auto_grow_sessions = enabled;
        self
    }

    /// Set the acknowledgement mode of pooled sessions
    #[must_use]
    pub fn acknowledgement_mode(mut self, mode: AcknowledgementMode) -> Self {
        self.settings.acknowledgement_mode = mode;
        self
    }

    /// Add an endpoint without credentials
    #[must_use]
    pub fn endpoint(mut self, uri: impl Into<String>) -> Self {
        self.settings.endpoints.push(Endpoint::new(uri));
        self
    }

    /// Add an endpoint with credentials
    #[must_use]
    pub fn endpoint_with_credentials(
        mut self,
        uri: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        self.settings
            .endpoints
            .push(Endpoint::new(uri).with_credentials(credentials));
        self
    }

    /// Select the endpoint strategy by name
    #[must_use]
    pub fn endpoint_strategy(mut self, name: impl Into<String>) -> Self {
        self.settings.endpoint_strategy = name.into();
        self
    }

    /// Set the recovery period
    #[must_use]
    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.settings.recovery_interval = interval;
        self
    }

    /// Set the cleanup period
    #[must_use]
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.settings.cleanup_interval = interval;
        self
    }

    /// Set the status report period, zero to disable
    #[must_use]
    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.settings.status_interval = interval;
        self
    }

    /// Set the polling period for bounded connection waits
    #[must_use]
    pub fn connection_poll_interval(mut self, interval: Duration) -> Self {
        self.settings.connection_poll_interval = interval;
        self
    }

    /// Set how long producer sends wait for a binding
    #[must_use]
    pub fn producer_ready_timeout(mut self, timeout: Duration) -> Self {
        self.settings.producer_ready_timeout = timeout;
        self
    }

    /// Build the settings
    pub fn build(self) -> PoolResult<PoolSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.connection_count, 1);
        assert_eq!(settings.min_sessions_per_connection, 10);
        assert_eq!(settings.max_sessions_per_connection, 50);
        assert!(settings.auto_grow_sessions);
        assert_eq!(
            settings.acknowledgement_mode,
            AcknowledgementMode::AutoAcknowledge
        );
        assert_eq!(settings.endpoint_strategy, "round-robin");
        assert_eq!(settings.recovery_interval, Duration::from_secs(1));
        assert_eq!(settings.cleanup_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_validates() {
        assert!(matches!(
            PoolSettings::builder().build(),
            Err(PoolError::Configuration(_))
        ));
        assert!(matches!(
            PoolSettings::builder()
                .endpoint("tcp://a")
                .connection_count(0)
                .build(),
            Err(PoolError::Configuration(_))
        ));
        assert!(matches!(
            PoolSettings::builder()
                .endpoint("tcp://a")
                .min_sessions(6)
                .max_sessions(5)
                .build(),
            Err(PoolError::Configuration(_))
        ));
        assert!(matches!(
            PoolSettings::builder()
                .endpoint("tcp://a")
                .recovery_interval(Duration::ZERO)
                .build(),
            Err(PoolError::Configuration(_))
        ));

        let settings = PoolSettings::builder()
            .endpoint("tcp://a")
            .endpoint_with_credentials("tcp://b", Credentials::new("u", "p"))
            .connection_count(4)
            .build()
            .unwrap();
        assert_eq!(settings.endpoints.len(), 2);
        assert_eq!(settings.connection_count, 4);
    }

    #[test]
    fn test_deserialize_partial_document() {
        let settings: PoolSettings = serde_json::from_str(
            r#"{
                "connection_count": 3,
                "acknowledgement_mode": "client_acknowledge",
                "endpoints": [{"uri": "tcp://a:61616"}, {"uri": "tcp://b:61616"}]
            }"#,
        )
        .unwrap();
        assert_eq!(settings.connection_count, 3);
        assert_eq!(
            settings.acknowledgement_mode,
            AcknowledgementMode::ClientAcknowledge
        );
        assert_eq!(settings.max_sessions_per_connection, 50);
        assert!(settings.validate().is_ok());
    }
}
