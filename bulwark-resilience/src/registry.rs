//! Named circuit breakers shared across callers

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::events::BreakerListener;

#[derive(Default)]
struct RegistryInner {
    breakers: HashMap<String, CircuitBreaker>,
    overrides: HashMap<String, CircuitBreakerConfig>,
    listeners: Vec<Arc<dyn BreakerListener>>,
}

/// One circuit breaker per resource name.
///
/// Cloning yields another handle to the same registry. Callers asking for the
/// same name always get handles to the same breaker, so every executor
/// protecting a resource shares its failure accounting.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    defaults: Arc<CircuitBreakerConfig>,
    inner: Arc<RwLock<RegistryInner>>,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("defaults", &self.defaults)
            .field("breakers", &self.names())
            .finish()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose breakers use `defaults` unless configured per name
    pub fn with_defaults(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults: Arc::new(defaults),
            inner: Arc::default(),
        }
    }

    /// Configuration used for `name` when its breaker is first created
    pub fn configure(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        self.inner.write().overrides.insert(name.into(), config);
    }

    /// Attach a listener to every breaker, present and future
    pub fn add_listener(&self, listener: Arc<dyn BreakerListener>) {
        let mut inner = self.inner.write();
        for breaker in inner.breakers.values() {
            breaker.add_listener(listener.clone());
        }
        inner.listeners.push(listener);
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.inner.read().breakers.get(name).cloned()
    }

    /// Breaker for `name`, created from the configured or default settings
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }

        let mut inner = self.inner.write();
        let config = inner
            .overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.as_ref().clone());
        Self::insert_locked(&mut inner, name, config)
    }

    /// Breaker for `name`, created from `config` if it does not exist yet.
    ///
    /// An existing breaker keeps its original configuration.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }

        let mut inner = self.inner.write();
        Self::insert_locked(&mut inner, name, config)
    }

    fn insert_locked(
        inner: &mut RegistryInner,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> CircuitBreaker {
        // Another caller may have won the race for the write lock
        if let Some(existing) = inner.breakers.get(name) {
            return existing.clone();
        }

        let breaker = CircuitBreaker::new(name, config);
        for listener in &inner.listeners {
            breaker.add_listener(listener.clone());
        }
        log::debug!("Registered circuit breaker '{}'", name);
        inner.breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    /// Reset every registered breaker to closed
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.inner.read().breakers.values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Current state of every registered breaker
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        let breakers: Vec<_> = self.inner.read().breakers.values().cloned().collect();
        breakers
            .into_iter()
            .map(|breaker| (breaker.name().to_string(), breaker.state()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().breakers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BreakerEvent, BreakerEventKind};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_same_name_shares_breaker() {
        let registry = BreakerRegistry::new();

        let first = registry.get_or_create("inventory");
        let second = registry.get_or_create("inventory");

        first.force_open();
        assert!(second.is_open());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_configured_override_applies() {
        let registry = BreakerRegistry::with_defaults(CircuitBreakerConfig {
            failure_threshold: 10,
            ..Default::default()
        });
        registry.configure(
            "payments",
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );

        assert_eq!(registry.get_or_create("payments").config().failure_threshold, 1);
        assert_eq!(registry.get_or_create("search").config().failure_threshold, 10);
    }

    #[test]
    fn test_reset_all_and_states() {
        let registry = BreakerRegistry::new();
        registry.get_or_create("a").force_open();
        registry.get_or_create("b");

        let states = registry.states();
        assert_eq!(states["a"], CircuitState::Open);
        assert_eq!(states["b"], CircuitState::Closed);

        registry.reset_all();
        assert!(registry
            .states()
            .values()
            .all(|state| *state == CircuitState::Closed));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_listeners_reach_existing_and_new_breakers() {
        let registry = BreakerRegistry::new();
        let existing = registry.get_or_create("existing");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.add_listener(Arc::new(move |event: &BreakerEvent| {
            if event.kind == BreakerEventKind::Open {
                sink.lock().push(event.name.clone());
            }
        }));

        existing.force_open();
        registry.get_or_create("later").force_open();

        assert_eq!(*seen.lock(), vec!["existing".to_string(), "later".to_string()]);
    }
}
