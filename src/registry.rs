//! Handler registry: registration, resolution, health, and drain.
//!
//! Read-mostly: resolution takes the lock briefly and clones the
//! definition out; counters are updated through the same lock on the
//! execution path. Health probes run outside the lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::handler::{Handler, HealthProbe, RetryPolicy, RetryPolicyError};
use crate::limits::LimitOverrides;

/// Consecutive probe failures before a handler is marked degraded.
const DEGRADE_AFTER_FAILURES: u32 = 3;

/// Intent-type tags that match any requested type.
const WILDCARDS: [&str; 2] = ["*", "default"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered: {0}")]
    Duplicate(String),
    #[error("handler not found: {0}")]
    NotFound(String),
    #[error("handler {field} must not be empty")]
    EmptyField { field: &'static str },
    #[error("handler must declare at least one intent type")]
    NoIntentTypes,
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(#[from] RetryPolicyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Active,
    Degraded,
    Draining,
    Inactive,
}

/// What a handler author registers.
#[derive(Clone)]
pub struct HandlerDefinition {
    pub name: String,
    pub version: String,
    pub intent_types: Vec<String>,
    pub handler: Arc<dyn Handler>,
    pub resource_defaults: LimitOverrides,
    pub health_probe: Option<Arc<dyn HealthProbe>>,
    pub retry_policy: Option<RetryPolicy>,
}

impl std::fmt::Debug for HandlerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("intent_types", &self.intent_types)
            .finish_non_exhaustive()
    }
}

impl HandlerDefinition {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            intent_types: Vec::new(),
            handler,
            resource_defaults: LimitOverrides::default(),
            health_probe: None,
            retry_policy: None,
        }
    }

    pub fn intent_type(mut self, intent_type: impl Into<String>) -> Self {
        self.intent_types.push(intent_type.into());
        self
    }

    /// Accept every intent type.
    pub fn wildcard(mut self) -> Self {
        self.intent_types.push("*".into());
        self
    }

    pub fn resource_defaults(mut self, defaults: LimitOverrides) -> Self {
        self.resource_defaults = defaults;
        self
    }

    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    fn matches_intent_type(&self, intent_type: &str) -> bool {
        self.intent_types
            .iter()
            .any(|t| t == intent_type || WILDCARDS.contains(&t.as_str()))
    }
}

#[derive(Debug)]
struct Registration {
    definition: HandlerDefinition,
    registered_at: DateTime<Utc>,
    status: HandlerStatus,
    execution_count: u64,
    failure_count: u64,
    consecutive_probe_failures: u32,
    last_execution_at: Option<DateTime<Utc>>,
    avg_duration_ms: f64,
    in_flight: u64,
}

impl Registration {
    fn failure_rate(&self) -> f64 {
        if self.execution_count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.execution_count as f64
        }
    }
}

/// Serializable view of one registration.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerSnapshot {
    pub name: String,
    pub version: String,
    pub intent_types: Vec<String>,
    pub status: HandlerStatus,
    pub registered_at: DateTime<Utc>,
    pub execution_count: u64,
    pub failure_count: u64,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub avg_duration_ms: f64,
    pub in_flight: u64,
}

impl From<&Registration> for HandlerSnapshot {
    fn from(reg: &Registration) -> Self {
        Self {
            name: reg.definition.name.clone(),
            version: reg.definition.version.clone(),
            intent_types: reg.definition.intent_types.clone(),
            status: reg.status,
            registered_at: reg.registered_at,
            execution_count: reg.execution_count,
            failure_count: reg.failure_count,
            last_execution_at: reg.last_execution_at,
            avg_duration_ms: reg.avg_duration_ms,
            in_flight: reg.in_flight,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Registration>,
}

/// Thread-safe handler registry shared by the engine and the API layer.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    state: Arc<Mutex<RegistryState>>,
    drained: Arc<Notify>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("handlers", &self.list().len()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, definition: HandlerDefinition) -> Result<(), RegistryError> {
        if definition.name.is_empty() {
            return Err(RegistryError::EmptyField { field: "name" });
        }
        if definition.version.is_empty() {
            return Err(RegistryError::EmptyField { field: "version" });
        }
        if definition.intent_types.is_empty() || definition.intent_types.iter().any(String::is_empty)
        {
            return Err(RegistryError::NoIntentTypes);
        }
        if let Some(policy) = &definition.retry_policy {
            policy.validate()?;
        }

        let mut state = self.lock();
        if state.handlers.contains_key(&definition.name) {
            return Err(RegistryError::Duplicate(definition.name));
        }
        let name = definition.name.clone();
        state.handlers.insert(
            name.clone(),
            Registration {
                definition,
                registered_at: Utc::now(),
                status: HandlerStatus::Active,
                execution_count: 0,
                failure_count: 0,
                consecutive_probe_failures: 0,
                last_execution_at: None,
                avg_duration_ms: 0.0,
                in_flight: 0,
            },
        );
        tracing::info!(handler = %name, "handler registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut state = self.lock();
        state
            .handlers
            .remove(name)
            .map(|_| tracing::info!(handler = name, "handler unregistered"))
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))
    }

    pub fn get_by_name(&self, name: &str) -> Option<HandlerSnapshot> {
        self.lock().handlers.get(name).map(HandlerSnapshot::from)
    }

    pub fn get_by_intent_type(&self, intent_type: &str) -> Vec<HandlerSnapshot> {
        let state = self.lock();
        let mut snapshots: Vec<HandlerSnapshot> = state
            .handlers
            .values()
            .filter(|r| r.definition.matches_intent_type(intent_type))
            .map(HandlerSnapshot::from)
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Definition and current status, for the engine's explicit-name path.
    pub fn definition(&self, name: &str) -> Option<(HandlerDefinition, HandlerStatus)> {
        self.lock().handlers.get(name).map(|r| (r.definition.clone(), r.status))
    }

    /// Pick the best active handler for `intent_type`: lowest failure
    /// rate, then lowest average duration, then name (so ties are
    /// deterministic). With `priority`, only handlers whose timeout can
    /// absorb it are considered.
    pub fn resolve(&self, intent_type: &str, priority: Option<u8>) -> Option<HandlerDefinition> {
        let state = self.lock();
        let mut candidates: Vec<&Registration> = state
            .handlers
            .values()
            .filter(|r| r.status == HandlerStatus::Active)
            .filter(|r| r.definition.matches_intent_type(intent_type))
            .collect();

        if let Some(priority) = priority {
            candidates.retain(|r| {
                r.definition
                    .resource_defaults
                    .timeout_ms
                    .map_or(true, |timeout| timeout >= priority as u64)
            });
        }

        candidates.sort_by(|a, b| {
            a.failure_rate()
                .partial_cmp(&b.failure_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.avg_duration_ms
                        .partial_cmp(&b.avg_duration_ms)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then_with(|| a.definition.name.cmp(&b.definition.name))
        });
        candidates.first().map(|r| r.definition.clone())
    }

    pub fn set_status(&self, name: &str, status: HandlerStatus) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let reg = state
            .handlers
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
        reg.status = status;
        drop(state);
        self.drained.notify_waiters();
        Ok(())
    }

    /// Degrade a handler without touching probe counters (used when its
    /// circuit opens).
    pub fn mark_degraded(&self, name: &str) {
        if let Some(reg) = self.lock().handlers.get_mut(name) {
            if reg.status == HandlerStatus::Active {
                reg.status = HandlerStatus::Degraded;
                tracing::warn!(handler = name, "handler marked degraded");
            }
        }
    }

    /// Track one in-flight execution; the guard decrements on drop so
    /// drains complete even when an execution panics.
    pub fn begin_execution(&self, name: &str) -> Option<InFlightGuard> {
        let mut state = self.lock();
        let reg = state.handlers.get_mut(name)?;
        reg.in_flight += 1;
        Some(InFlightGuard { registry: self.clone(), name: name.to_owned() })
    }

    /// Update rolling statistics after an attempt sequence finishes.
    pub fn record_execution(&self, name: &str, duration: Duration, success: bool) {
        let mut state = self.lock();
        if let Some(reg) = state.handlers.get_mut(name) {
            reg.execution_count += 1;
            if !success {
                reg.failure_count += 1;
            }
            reg.last_execution_at = Some(Utc::now());
            let duration_ms = duration.as_millis() as f64;
            let n = reg.execution_count as f64;
            reg.avg_duration_ms += (duration_ms - reg.avg_duration_ms) / n;
        }
    }

    /// Mark `name` draining, wait until its in-flight count reaches
    /// zero, then set it inactive.
    pub async fn drain(&self, name: &str) -> Result<(), RegistryError> {
        self.set_status(name, HandlerStatus::Draining)?;
        tracing::info!(handler = name, "handler draining");
        loop {
            let notified = self.drained.notified();
            {
                let state = self.lock();
                let reg = state
                    .handlers
                    .get(name)
                    .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
                if reg.in_flight == 0 {
                    break;
                }
            }
            notified.await;
        }
        self.set_status(name, HandlerStatus::Inactive)?;
        tracing::info!(handler = name, "handler drained → inactive");
        Ok(())
    }

    /// Run the handler's probe. Three consecutive failures degrade it; a
    /// success restores an active status and resets the counter.
    pub async fn check_health(&self, name: &str) -> Result<bool, RegistryError> {
        let probe = {
            let state = self.lock();
            let reg = state
                .handlers
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
            reg.definition.health_probe.clone()
        };

        let healthy = match probe {
            Some(probe) => probe.healthy().await,
            // No probe: trust the registration.
            None => true,
        };

        let mut state = self.lock();
        let reg = state
            .handlers
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
        if healthy {
            reg.consecutive_probe_failures = 0;
            if reg.status == HandlerStatus::Degraded {
                reg.status = HandlerStatus::Active;
                tracing::info!(handler = name, "handler recovered → active");
            }
        } else {
            reg.consecutive_probe_failures += 1;
            if reg.consecutive_probe_failures >= DEGRADE_AFTER_FAILURES
                && reg.status == HandlerStatus::Active
            {
                reg.status = HandlerStatus::Degraded;
                tracing::warn!(
                    handler = name,
                    failures = reg.consecutive_probe_failures,
                    "handler degraded after failed health checks"
                );
            }
        }
        Ok(healthy)
    }

    pub async fn check_all_health(&self) -> Vec<(String, bool)> {
        let names: Vec<String> = self.lock().handlers.keys().cloned().collect();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(healthy) = self.check_health(&name).await {
                results.push((name, healthy));
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    pub fn list(&self) -> Vec<HandlerSnapshot> {
        let state = self.lock();
        let mut snapshots: Vec<HandlerSnapshot> =
            state.handlers.values().map(HandlerSnapshot::from).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn active_count(&self) -> usize {
        self.lock().handlers.values().filter(|r| r.status == HandlerStatus::Active).count()
    }

    pub fn any_degraded(&self) -> bool {
        self.lock().handlers.values().any(|r| r.status == HandlerStatus::Degraded)
    }
}

/// RAII in-flight marker; see [`HandlerRegistry::begin_execution`].
pub struct InFlightGuard {
    registry: HandlerRegistry,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        {
            let mut state = self.registry.lock();
            if let Some(reg) = state.handlers.get_mut(&self.name) {
                reg.in_flight = reg.in_flight.saturating_sub(1);
            }
        }
        self.registry.drained.notify_waiters();
    }
}
