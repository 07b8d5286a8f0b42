//! Registry of named circuit breakers.
//!
//! The engine keeps one breaker per handler (`cognigate-handler-{name}`)
//! plus breakers for the cache's distributed tier and the audit sink;
//! health reporting snapshots them all here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

#[derive(Default, Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry").field("breakers", &self.snapshot()).finish()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), default_config }
    }

    /// Fetch the breaker for `name`, creating it with the registry's
    /// default config on first use. Clones share state.
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(name.to_owned())
            .or_insert_with(|| CircuitBreaker::new(name, self.default_config.clone()))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).get(name).cloned()
    }

    /// Reset a breaker to closed. Errors when the name is unknown.
    pub fn reset(&self, name: &str) -> Result<(), String> {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(format!("circuit not found: {name}")),
        }
    }

    /// Sorted (name, state) snapshot for health reporting.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// True when any registered circuit is currently open.
    pub fn any_open(&self) -> bool {
        self.snapshot().iter().any(|(_, state)| *state == CircuitState::Open)
    }
}
