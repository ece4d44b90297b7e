//! Endpoint registries and the strategy table that selects one.
//!
//! A registry partitions the configured endpoints into a valid and an invalid
//! set and hands out the next valid endpoint for each new connection. An
//! invalidated endpoint stays invalid until it is explicitly added again;
//! nothing in the pool re-validates endpoints on its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::error::{PoolError, PoolResult};

/// Selects endpoints for new connections.
pub trait EndpointRegistry: Send + Sync + fmt::Debug {
    /// Adds an endpoint to the valid set. Re-adding an invalidated endpoint
    /// makes it valid again; adding a valid one is a no-op.
    fn add(&self, endpoint: Endpoint);

    /// Picks the next valid endpoint.
    fn next(&self) -> PoolResult<Endpoint>;

    /// Moves an endpoint from the valid to the invalid set. Unknown or
    /// already invalid endpoints are ignored.
    fn invalidate(&self, endpoint: &Endpoint);

    /// Snapshot of the valid endpoints.
    fn valid(&self) -> Vec<Endpoint>;

    /// Snapshot of the invalid endpoints.
    fn invalid(&self) -> Vec<Endpoint>;
}

#[derive(Debug, Default)]
struct Partition {
    valid: Vec<Endpoint>,
    invalid: Vec<Endpoint>,
    cursor: usize,
}

impl Partition {
    fn add(&mut self, endpoint: Endpoint) {
        self.invalid.retain(|e| e != &endpoint);
        if !self.valid.contains(&endpoint) {
            self.valid.push(endpoint);
        }
    }

    fn invalidate(&mut self, endpoint: &Endpoint) {
        if let Some(index) = self.valid.iter().position(|e| e == endpoint) {
            let removed = self.valid.remove(index);
            self.invalid.push(removed);
            if self.cursor >= self.valid.len() {
                self.cursor = 0;
            }
        }
    }
}

/// Hands out valid endpoints in rotation.
#[derive(Debug, Default)]
pub struct RoundRobinRegistry {
    state: Mutex<Partition>,
}

impl RoundRobinRegistry {
    /// Creates a registry holding `endpoints` in the valid set.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let registry = Self::default();
        for endpoint in endpoints {
            registry.add(endpoint);
        }
        registry
    }
}

impl EndpointRegistry for RoundRobinRegistry {
    fn add(&self, endpoint: Endpoint) {
        self.state.lock().add(endpoint);
    }

    fn next(&self) -> PoolResult<Endpoint> {
        let mut state = self.state.lock();
        if state.valid.is_empty() {
            return Err(PoolError::NoEndpointsAvailable);
        }
        if state.cursor >= state.valid.len() {
            state.cursor = 0;
        }
        let endpoint = state.valid[state.cursor].clone();
        state.cursor = (state.cursor + 1) % state.valid.len();
        Ok(endpoint)
    }

    fn invalidate(&self, endpoint: &Endpoint) {
        self.state.lock().invalidate(endpoint);
    }

    fn valid(&self) -> Vec<Endpoint> {
        self.state.lock().valid.clone()
    }

    fn invalid(&self) -> Vec<Endpoint> {
        self.state.lock().invalid.clone()
    }
}

/// Always hands out the highest-priority valid endpoint.
///
/// Priority is the order endpoints were first added in: the first one is the
/// primary and the rest are backups, tried in order once the ones ahead of
/// them are invalidated. Re-adding an endpoint restores its original rank.
#[derive(Debug, Default)]
pub struct FailoverRegistry {
    state: Mutex<FailoverState>,
}

#[derive(Debug, Default)]
struct FailoverState {
    ranked: Vec<Endpoint>,
    invalid: Vec<Endpoint>,
}

impl FailoverRegistry {
    /// Creates a registry with `endpoints` in priority order.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let registry = Self::default();
        for endpoint in endpoints {
            registry.add(endpoint);
        }
        registry
    }
}

impl EndpointRegistry for FailoverRegistry {
    fn add(&self, endpoint: Endpoint) {
        let mut state = self.state.lock();
        state.invalid.retain(|e| e != &endpoint);
        if !state.ranked.contains(&endpoint) {
            state.ranked.push(endpoint);
        }
    }

    fn next(&self) -> PoolResult<Endpoint> {
        let state = self.state.lock();
        state
            .ranked
            .iter()
            .find(|e| !state.invalid.contains(e))
            .cloned()
            .ok_or(PoolError::NoEndpointsAvailable)
    }

    fn invalidate(&self, endpoint: &Endpoint) {
        let mut state = self.state.lock();
        if state.ranked.contains(endpoint) && !state.invalid.contains(endpoint) {
            state.invalid.push(endpoint.clone());
        }
    }

    fn valid(&self) -> Vec<Endpoint> {
        let state = self.state.lock();
        state
            .ranked
            .iter()
            .filter(|e| !state.invalid.contains(e))
            .cloned()
            .collect()
    }

    fn invalid(&self) -> Vec<Endpoint> {
        self.state.lock().invalid.clone()
    }
}

/// Constructor stored in an [`EndpointStrategies`] table.
pub type RegistryFactory = Arc<dyn Fn(Vec<Endpoint>) -> Arc<dyn EndpointRegistry> + Send + Sync>;

/// Named endpoint selection strategies.
///
/// The pool looks its registry up here by the `endpoint_strategy` setting.
/// The default table knows [`ROUND_ROBIN`](Self::ROUND_ROBIN) and
/// [`FAILOVER`](Self::FAILOVER); applications can register their own.
#[derive(Clone)]
pub struct EndpointStrategies {
    factories: HashMap<String, RegistryFactory>,
}

impl EndpointStrategies {
    /// Name of the [`RoundRobinRegistry`] strategy.
    pub const ROUND_ROBIN: &'static str = "round-robin";
    /// Name of the [`FailoverRegistry`] strategy.
    pub const FAILOVER: &'static str = "failover";

    /// Creates an empty table.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers (or replaces) a strategy.
    #[must_use]
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Vec<Endpoint>) -> Arc<dyn EndpointRegistry> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Returns `true` if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered strategy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds the registry for strategy `name`.
    pub fn create(
        &self,
        name: &str,
        endpoints: Vec<Endpoint>,
    ) -> PoolResult<Arc<dyn EndpointRegistry>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            PoolError::Configuration(format!(
                "unknown endpoint strategy '{name}', expected one of: {}",
                self.names().join(", ")
            ))
        })?;
        Ok(factory(endpoints))
    }
}

impl Default for EndpointStrategies {
    fn default() -> Self {
        Self::empty()
            .register(Self::ROUND_ROBIN, |endpoints| {
                Arc::new(RoundRobinRegistry::new(endpoints)) as Arc<dyn EndpointRegistry>
            })
            .register(Self::FAILOVER, |endpoints| {
                Arc::new(FailoverRegistry::new(endpoints)) as Arc<dyn EndpointRegistry>
            })
    }
}

impl fmt::Debug for EndpointStrategies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointStrategies")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn endpoints(uris: &[&str]) -> Vec<Endpoint> {
        uris.iter().map(|uri| Endpoint::new(*uri)).collect()
    }

    #[test]
    fn test_round_robin_rotation() {
        let registry = RoundRobinRegistry::new(endpoints(&["a", "b", "c"]));
        let picks: Vec<String> = (0..4).map(|_| registry.next().unwrap().uri).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_invalidated_endpoint_is_skipped_until_readded() {
        let registry = RoundRobinRegistry::new(endpoints(&["a", "b", "c"]));
        registry.invalidate(&Endpoint::new("b"));
        assert_eq!(registry.invalid(), endpoints(&["b"]));

        for _ in 0..6 {
            assert_ne!(registry.next().unwrap().uri, "b");
        }

        registry.add(Endpoint::new("b"));
        assert!(registry.invalid().is_empty());
        let picks: Vec<String> = (0..3).map(|_| registry.next().unwrap().uri).collect();
        assert!(picks.contains(&"b".to_string()));
    }

    #[test]
    fn test_cursor_resets_when_valid_set_shrinks() {
        let registry = RoundRobinRegistry::new(endpoints(&["a", "b", "c"]));
        registry.next().unwrap();
        registry.next().unwrap();
        registry.invalidate(&Endpoint::new("c"));
        registry.invalidate(&Endpoint::new("b"));
        assert_eq!(registry.next().unwrap().uri, "a");
    }

    #[test]
    fn test_empty_registry_fails() {
        let registry = RoundRobinRegistry::new(endpoints(&["a"]));
        registry.invalidate(&Endpoint::new("a"));
        assert_eq!(registry.next(), Err(PoolError::NoEndpointsAvailable));
        // Unknown endpoints are ignored.
        registry.invalidate(&Endpoint::new("zzz"));
        assert_eq!(registry.invalid().len(), 1);
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = RoundRobinRegistry::new(endpoints(&["a", "a", "b"]));
        assert_eq!(registry.valid().len(), 2);
    }

    #[test]
    fn test_failover_prefers_primary() {
        let registry = FailoverRegistry::new(endpoints(&["primary", "backup1", "backup2"]));
        assert_eq!(registry.next().unwrap().uri, "primary");
        assert_eq!(registry.next().unwrap().uri, "primary");

        registry.invalidate(&Endpoint::new("primary"));
        assert_eq!(registry.next().unwrap().uri, "backup1");

        registry.add(Endpoint::new("primary"));
        assert_eq!(registry.next().unwrap().uri, "primary");
        assert_eq!(registry.valid(), endpoints(&["primary", "backup1", "backup2"]));
    }

    #[test]
    fn test_strategy_table() {
        let strategies = EndpointStrategies::default();
        assert_eq!(strategies.names(), vec!["failover", "round-robin"]);

        let registry = strategies
            .create(EndpointStrategies::FAILOVER, endpoints(&["x", "y"]))
            .unwrap();
        assert_eq!(registry.next().unwrap().uri, "x");
        assert_eq!(registry.next().unwrap().uri, "x");

        assert!(matches!(
            strategies.create("random", endpoints(&["x"])),
            Err(PoolError::Configuration(_))
        ));

        let custom = strategies.register("first-only", |endpoints| {
            Arc::new(FailoverRegistry::new(endpoints.into_iter().take(1))) as Arc<dyn EndpointRegistry>
        });
        assert!(custom.contains("first-only"));
    }
}
