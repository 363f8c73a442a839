//! Process-wide lookup of named circuit breakers.

use std::sync::Arc;

use citadel_core::CircuitBreakerSettings;
use dashmap::DashMap;
use tracing::{debug, info};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};

/// Named breakers, created on first use.
///
/// Constructed once and shared as `Arc<CircuitBreakerRegistry>`. Entries are
/// never removed individually; [`CircuitBreakerRegistry::shutdown`] cancels
/// every armed reset timer.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers default to `defaults`.
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    /// Create a shared registry from settings.
    #[must_use]
    pub fn from_settings(settings: &CircuitBreakerSettings) -> Arc<Self> {
        Arc::new(Self::new(CircuitBreakerConfig::from_settings(settings)))
    }

    /// Default configuration for new breakers.
    #[must_use]
    pub const fn defaults(&self) -> &CircuitBreakerConfig {
        &self.defaults
    }

    /// Return the breaker for `name`, creating it with the defaults.
    #[must_use]
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        self.get_or_create_with(name, self.defaults.clone())
    }

    /// Return the breaker for `name`, creating it with `config` if absent.
    ///
    /// An existing breaker keeps its original configuration.
    #[must_use]
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(name) {
            return existing.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(circuit = name, "Circuit breaker created");
                CircuitBreaker::new(name, config)
            })
            .value()
            .clone()
    }

    /// Names of every breaker created so far, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshots of every breaker, sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Number of breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Cancel every armed reset timer.
    pub fn shutdown(&self) {
        for entry in &self.breakers {
            entry.value().shutdown();
        }
        info!(breakers = self.breakers.len(), "Circuit breaker registry shut down");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use super::*;
    use crate::resilience::CircuitState;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = CircuitBreakerRegistry::default();
        let first = registry.get_or_create("db");
        first.record_failure();

        let second = registry.get_or_create("db");
        assert_eq!(second.snapshot().window_failures, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_existing_breaker_keeps_original_config() {
        let registry = CircuitBreakerRegistry::default();
        let _ = registry.get_or_create_with(
            "cache",
            CircuitBreakerConfig::new(2, Duration::from_secs(1)),
        );
        let again = registry.get_or_create("cache");
        assert_eq!(again.config().failure_threshold, 2);
    }

    #[test]
    fn test_defaults_come_from_settings() {
        let settings = CircuitBreakerSettings {
            failure_threshold: 9,
            ..CircuitBreakerSettings::default()
        };
        let registry = CircuitBreakerRegistry::from_settings(&settings);
        assert_eq!(registry.get_or_create("x").config().failure_threshold, 9);
    }

    #[test]
    fn test_names_and_snapshots_are_sorted() {
        let registry = CircuitBreakerRegistry::default();
        let _ = registry.get_or_create("b");
        let _ = registry.get_or_create("a");

        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "a");
        assert_eq!(snapshots[0].state, CircuitState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_yields_one_breaker() {
        let registry = Arc::new(CircuitBreakerRegistry::default());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.get_or_create("shared").record_failure();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), 1);
        // Default threshold is 5, so 16 failures opened it.
        assert_eq!(registry.get_or_create("shared").state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_entries() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::new(
            1,
            Duration::from_secs(60),
        ));
        registry.get_or_create("db").record_failure();
        registry.shutdown();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_or_create("db").state(), CircuitState::Open);
    }
}
