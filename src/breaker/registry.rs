//! Name → breaker map owned by the executor.
//!
//! Breakers are created lazily the first time a name is used and then reused,
//! so repeated calls to the same named operation share failure history.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use super::{BreakerConfig, BreakerSnapshot, CircuitBreaker};

#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Use `config` for the breaker named `name` instead of the defaults.
    pub fn with_override(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    pub fn defaults(&self) -> BreakerConfig {
        self.defaults
    }

    /// Config a breaker named `name` would be created with.
    pub fn config_for(&self, name: &str) -> BreakerConfig {
        self.overrides.get(name).copied().unwrap_or(self.defaults)
    }

    /// Get the breaker for `name`, creating it from configured settings on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.config_for(name))
    }

    /// Get the breaker for `name`, creating it with `config` if it does not exist yet.
    /// An existing breaker keeps its original config and state.
    pub fn get_or_create_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, threshold = config.failure_threshold, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            });
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every breaker created so far, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::errors::CallError;
    use std::time::Duration;

    #[test]
    fn same_name_returns_same_breaker() {
        let registry = BreakerRegistry::default();
        let a = registry.get("gcloud");
        let b = registry.get("gcloud");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn overrides_apply_on_creation() {
        let registry = BreakerRegistry::new(BreakerConfig::default())
            .with_override("billing", BreakerConfig::new(2, Duration::from_secs(10)));
        assert_eq!(registry.get("billing").config().failure_threshold, 2);
        assert_eq!(registry.get("iam").config().failure_threshold, 5);
    }

    #[test]
    fn caller_config_ignored_for_existing_breaker() {
        let registry = BreakerRegistry::default();
        let first = registry.get_or_create_with("api", BreakerConfig::new(3, Duration::from_secs(1)));
        let second = registry.get_or_create_with("api", BreakerConfig::new(9, Duration::from_secs(9)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn state_persists_across_lookups() {
        let registry = BreakerRegistry::new(BreakerConfig::new(1, Duration::from_secs(30)));
        let result: Result<(), CallError<&str>> =
            registry.get("api").call(|| async { Err("down") }).await;
        assert!(result.is_err());
        assert_eq!(registry.get("api").state(), BreakerState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_share_one_breaker() {
        let registry = Arc::new(BreakerRegistry::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.get("shared") }));
        }
        let mut breakers = Vec::new();
        for handle in handles {
            breakers.push(handle.await.unwrap());
        }
        assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshots_sorted_by_name() {
        let registry = BreakerRegistry::default();
        registry.get("zeta");
        registry.get("alpha");
        let names: Vec<_> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
