//! The execution engine: orchestrates one intent from validation through
//! admission, breaker-gated handler attempts, monitoring, retries, and
//! cleanup.
//!
//! Failure surfaces split in two: rejections before the lifecycle starts
//! (validation, resolution, admission) return `Err`; once
//! `execution_started` is audited, every outcome is an
//! [`ExecutionResult`] whose terminal status and error record follow the
//! mapping table. Slots, monitors, and tracking entries are released on
//! every exit path without handler cooperation.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::audit::{
    AuditBuffer, AuditConfig, AuditEntry, AuditEventType, AuditOutcome, AuditSink, Severity,
    TracingAuditSink,
};
use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::cache::{CacheConfig, CacheKey, ExecutionCache};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitError};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::handler::HandlerContext;
use crate::health::{HealthCheck, HealthReport, ReadinessReport};
use crate::jitter::Jitter;
use crate::limits::{ResourceLimits, ResourceUsage};
use crate::lock::{LockOptions, LockService};
use crate::monitor::{
    MonitorConfig, NoopSampler, ProcessSampler, ResourceMonitor, ThresholdLevel, ThresholdSignal,
};
use crate::outcome::{ActiveExecution, ErrorRecord, ExecutionResult, ExecutionStatus};
use crate::registry::{HandlerDefinition, HandlerRegistry, HandlerStatus, RegistryError};
use crate::repository::ExecutionRepository;
use crate::store::DistributedStore;
use crate::time::{Sleeper, TokioSleeper};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_REASON: &str = "service shutdown";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_limits: ResourceLimits,
    pub bulkhead: BulkheadConfig,
    pub cache: CacheConfig,
    pub audit: AuditConfig,
    pub monitor: MonitorConfig,
    /// Default config for the per-handler `cognigate-handler-{name}`
    /// breakers.
    pub handler_breakers: CircuitBreakerConfig,
    pub graceful_shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_limits: ResourceLimits::default(),
            bulkhead: BulkheadConfig::default(),
            cache: CacheConfig::default(),
            audit: AuditConfig::default(),
            monitor: MonitorConfig::default(),
            handler_breakers: CircuitBreakerConfig::default(),
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

struct ActiveRecord {
    tenant_id: String,
    intent_id: String,
    handler_name: String,
    state: ExecutionStatus,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    cancellation: CancellationToken,
    paused: Arc<AtomicBool>,
    terminate_reason: Arc<Mutex<Option<String>>>,
    monitor: Option<ResourceMonitor>,
    retry_count: u32,
}

impl ActiveRecord {
    fn snapshot(&self, execution_id: &str) -> ActiveExecution {
        ActiveExecution {
            execution_id: execution_id.to_owned(),
            tenant_id: self.tenant_id.clone(),
            intent_id: self.intent_id.clone(),
            handler_name: self.handler_name.clone(),
            state: self.state,
            started_at: self.started_at,
            deadline: self.deadline,
            usage: self.monitor.as_ref().map(|m| m.usage()).unwrap_or_default(),
            retry_count: self.retry_count,
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: HandlerRegistry,
    bulkhead: Bulkhead,
    cache: ExecutionCache,
    audit: AuditBuffer,
    breakers: CircuitBreakerRegistry,
    locks: Option<LockService>,
    sampler: Arc<dyn ProcessSampler>,
    repository: Option<Arc<dyn ExecutionRepository>>,
    active: Mutex<HashMap<String, ActiveRecord>>,
    shutdown_requested: AtomicBool,
    sleeper: Arc<dyn Sleeper>,
    jitter: Jitter,
}

/// Cheaply cloneable handle; clones share all state.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("active", &self.active_executions().len())
            .finish_non_exhaustive()
    }
}

pub struct ExecutionEngineBuilder {
    config: EngineConfig,
    registry: HandlerRegistry,
    store: Option<Arc<dyn DistributedStore>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    repository: Option<Arc<dyn ExecutionRepository>>,
    sampler: Arc<dyn ProcessSampler>,
    sleeper: Arc<dyn Sleeper>,
}

impl ExecutionEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Enables the cache's distributed tier and the lock service.
    pub fn store(mut self, store: Arc<dyn DistributedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn ExecutionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn ProcessSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> ExecutionEngine {
        let sink: Arc<dyn AuditSink> = match (self.audit_sink, &self.repository) {
            (Some(sink), _) => sink,
            (None, Some(repository)) => {
                Arc::new(crate::repository::RepositoryAuditSink::new(Arc::clone(repository)))
            }
            (None, None) => Arc::new(TracingAuditSink),
        };

        let cache = ExecutionCache::new(self.config.cache, self.store.clone());
        let locks = self.store.clone().map(LockService::new);

        ExecutionEngine {
            inner: Arc::new(EngineInner {
                bulkhead: Bulkhead::new(self.config.bulkhead),
                audit: AuditBuffer::new(self.config.audit, sink),
                breakers: CircuitBreakerRegistry::new(self.config.handler_breakers.clone()),
                cache,
                locks,
                registry: self.registry,
                sampler: self.sampler,
                repository: self.repository,
                active: Mutex::new(HashMap::new()),
                shutdown_requested: AtomicBool::new(false),
                sleeper: self.sleeper,
                jitter: Jitter::fraction(0.25),
                config: self.config,
            }),
        }
    }
}

/// Removes the tracking record on every exit path, including panics.
struct TrackingGuard {
    inner: Arc<EngineInner>,
    execution_id: String,
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.execution_id);
    }
}

impl ExecutionEngine {
    pub fn builder() -> ExecutionEngineBuilder {
        ExecutionEngineBuilder {
            config: EngineConfig::default(),
            registry: HandlerRegistry::new(),
            store: None,
            audit_sink: None,
            repository: None,
            sampler: Arc::new(NoopSampler),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn audit(&self) -> &AuditBuffer {
        &self.inner.audit
    }

    pub fn cache(&self) -> &ExecutionCache {
        &self.inner.cache
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn bulkhead_stats(&self) -> crate::bulkhead::BulkheadStats {
        self.inner.bulkhead.stats()
    }

    /// Register a handler, refusing once shutdown has begun.
    pub fn register_handler(&self, definition: HandlerDefinition) -> Result<(), EngineError> {
        if self.inner.shutdown_requested.load(Ordering::SeqCst) {
            return Err(EngineError::conflict("engine is shutting down"));
        }
        self.inner.registry.register(definition).map_err(map_registry_error)
    }

    /// Run one approved intent to a terminal state.
    pub async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, EngineError> {
        if self.inner.shutdown_requested.load(Ordering::SeqCst) {
            return Err(EngineError::conflict("engine is shutting down"));
        }
        ctx.validate()?;

        let definition = self.resolve_definition(&ctx)?;
        let handler_name = definition.name.clone();

        let effective = self
            .inner
            .config
            .default_limits
            .merged(&definition.resource_defaults)
            .merged(&ctx.limit_overrides);
        effective
            .validate()
            .map_err(|err| EngineError::validation("LIMITS_INVALID", err.to_string()))?;

        let started_at = Utc::now();
        let timeout = effective.timeout();
        let mut deadline = started_at
            + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        if let Some(ctx_deadline) = ctx.deadline {
            deadline = deadline.min(ctx_deadline);
        }
        let effective_timeout =
            (deadline - started_at).to_std().unwrap_or(Duration::ZERO).max(Duration::from_millis(1));

        let token = match &ctx.cancellation {
            Some(external) => external.child_token(),
            None => CancellationToken::new(),
        };
        let paused = Arc::new(AtomicBool::new(false));
        let terminate_reason = Arc::new(Mutex::new(None));

        // Track. Duplicate execution ids are conflicts, not dedup hits.
        {
            let mut active = self.lock_active();
            if active.contains_key(&ctx.execution_id) {
                return Err(EngineError::conflict(format!(
                    "execution already in flight: {}",
                    ctx.execution_id
                )));
            }
            active.insert(
                ctx.execution_id.clone(),
                ActiveRecord {
                    tenant_id: ctx.tenant_id.clone(),
                    intent_id: ctx.intent.id.clone(),
                    handler_name: handler_name.clone(),
                    state: ExecutionStatus::Initializing,
                    started_at,
                    deadline,
                    cancellation: token.clone(),
                    paused: Arc::clone(&paused),
                    terminate_reason: Arc::clone(&terminate_reason),
                    monitor: None,
                    retry_count: 0,
                },
            );
        }
        let _tracking = TrackingGuard {
            inner: Arc::clone(&self.inner),
            execution_id: ctx.execution_id.clone(),
        };

        let outcome = self
            .run_admitted(
                &ctx,
                &definition,
                effective,
                started_at,
                deadline,
                effective_timeout,
                token.clone(),
                paused,
                terminate_reason,
            )
            .await;

        // The per-execution cancellation handle dies with the execution;
        // cancelling it reaps the deadline timer and the sampler.
        token.cancel();

        if let Ok(result) = &outcome {
            self.inner.registry.record_execution(
                &handler_name,
                Duration::from_millis(result.wall_time_ms),
                result.is_completed(),
            );
            if let Some(repository) = &self.inner.repository {
                if let Err(err) = repository.insert_execution(result).await {
                    tracing::warn!(%err, "failed to persist execution record");
                }
            }
        }
        outcome
    }

    /// Cache lookup, then `execute`, populating the cache on completion.
    pub async fn execute_with_cache(
        &self,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult, EngineError> {
        if self.inner.shutdown_requested.load(Ordering::SeqCst) {
            return Err(EngineError::conflict("engine is shutting down"));
        }
        ctx.validate()?;
        let key = self.cache_key(&ctx)?;

        if let Some(mut hit) = self.inner.cache.get(&key).await {
            hit.from_cache = true;
            return Ok(hit);
        }

        let result = self.execute(ctx).await?;
        self.inner.cache.put(&key, &result).await;
        Ok(result)
    }

    /// Like [`execute_with_cache`], but coalesces concurrent identical
    /// requests under a distributed lock so at most one handler
    /// invocation is observable. Falls back to the unlocked path when no
    /// store is configured or the lock cannot be taken.
    ///
    /// [`execute_with_cache`]: ExecutionEngine::execute_with_cache
    pub async fn execute_with_cache_locked(
        &self,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult, EngineError> {
        let Some(locks) = &self.inner.locks else {
            return self.execute_with_cache(ctx).await;
        };
        if self.inner.shutdown_requested.load(Ordering::SeqCst) {
            return Err(EngineError::conflict("engine is shutting down"));
        }
        ctx.validate()?;
        let key = self.cache_key(&ctx)?;

        if let Some(mut hit) = self.inner.cache.get(&key).await {
            hit.from_cache = true;
            return Ok(hit);
        }

        let opts = LockOptions {
            retries: 20,
            retry_delay: Duration::from_millis(50),
            acquisition_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        match locks.acquire(&key.serialize(), opts).await {
            Some(lock) => {
                // Double-check: the previous holder may have populated it.
                let outcome = if let Some(mut hit) = self.inner.cache.get(&key).await {
                    hit.from_cache = true;
                    Ok(hit)
                } else {
                    let result = self.execute(ctx).await;
                    if let Ok(result) = &result {
                        self.inner.cache.put(&key, result).await;
                    }
                    result
                };
                lock.release().await;
                outcome
            }
            None => {
                if let Some(mut hit) = self.inner.cache.get(&key).await {
                    hit.from_cache = true;
                    return Ok(hit);
                }
                self.execute_with_cache(ctx).await
            }
        }
    }

    /// Trip the execution's cancellation handle and mark it terminated.
    /// Returns whether the execution was found.
    pub fn terminate(&self, execution_id: &str, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut active = self.lock_active();
        match active.get_mut(execution_id) {
            Some(record) => {
                *record.terminate_reason.lock().unwrap_or_else(|p| p.into_inner()) =
                    Some(reason.clone());
                record.state = ExecutionStatus::Terminated;
                record.cancellation.cancel();
                tracing::info!(execution_id, reason, "execution terminate requested");
                true
            }
            None => false,
        }
    }

    /// Cooperative pause; only accepted while running.
    pub fn pause(&self, execution_id: &str) -> bool {
        let mut active = self.lock_active();
        let Some(record) = active.get_mut(execution_id) else { return false };
        if record.state != ExecutionStatus::Running {
            return false;
        }
        record.state = ExecutionStatus::Paused;
        record.paused.store(true, Ordering::Release);
        self.inner.audit.record(
            AuditEntry::new(
                record.tenant_id.clone(),
                execution_id,
                record.intent_id.clone(),
                AuditEventType::ExecutionPaused,
            )
            .handler(record.handler_name.clone()),
        );
        true
    }

    /// Inverse of [`pause`](ExecutionEngine::pause).
    pub fn resume(&self, execution_id: &str) -> bool {
        let mut active = self.lock_active();
        let Some(record) = active.get_mut(execution_id) else { return false };
        if record.state != ExecutionStatus::Paused {
            return false;
        }
        record.state = ExecutionStatus::Running;
        record.paused.store(false, Ordering::Release);
        self.inner.audit.record(
            AuditEntry::new(
                record.tenant_id.clone(),
                execution_id,
                record.intent_id.clone(),
                AuditEventType::ExecutionResumed,
            )
            .handler(record.handler_name.clone()),
        );
        true
    }

    pub fn active_executions(&self) -> Vec<ActiveExecution> {
        let active = self.lock_active();
        let mut snapshots: Vec<ActiveExecution> =
            active.iter().map(|(id, record)| record.snapshot(id)).collect();
        snapshots.sort_by(|a, b| a.execution_id.cmp(&b.execution_id));
        snapshots
    }

    pub fn status(&self, execution_id: &str) -> Option<ActiveExecution> {
        self.lock_active().get(execution_id).map(|record| record.snapshot(execution_id))
    }

    pub fn health(&self) -> HealthReport {
        let mut checks = BTreeMap::new();

        let active_handlers = self.inner.registry.active_count();
        let handlers = if active_handlers == 0 {
            HealthCheck::unhealthy("no active handlers")
        } else if self.inner.registry.any_degraded() {
            HealthCheck::degraded(format!("{active_handlers} active, some degraded"))
        } else {
            HealthCheck::healthy(format!("{active_handlers} active"))
        };
        checks.insert("handlers".to_owned(), handlers);

        let utilization = self.inner.bulkhead.global_utilization();
        let bulkhead = if utilization >= 0.9 {
            HealthCheck::degraded(format!("{:.0}% of global capacity in use", utilization * 100.0))
        } else {
            HealthCheck::healthy(format!("{:.0}% of global capacity in use", utilization * 100.0))
        };
        checks.insert("bulkhead".to_owned(), bulkhead);

        let cache = if self.inner.cache.l2_healthy() || self.inner.locks.is_none() {
            HealthCheck::healthy("cache operational").non_critical()
        } else {
            HealthCheck::degraded("distributed tier unavailable, l1-only").non_critical()
        };
        checks.insert("cache".to_owned(), cache);

        let audit = if self.inner.audit.dropped() > 0 {
            HealthCheck::degraded(format!("{} entries dropped", self.inner.audit.dropped()))
                .non_critical()
        } else {
            HealthCheck::healthy(format!("{} buffered", self.inner.audit.len())).non_critical()
        };
        checks.insert("audit".to_owned(), audit);

        let breakers = if self.inner.breakers.any_open() {
            HealthCheck::degraded("one or more circuits open").non_critical()
        } else {
            HealthCheck::healthy("all circuits closed").non_critical()
        };
        checks.insert("circuit_breakers".to_owned(), breakers);

        HealthReport::aggregate(checks)
    }

    pub fn readiness(&self) -> ReadinessReport {
        let mut checks = BTreeMap::new();
        let accepting = !self.inner.shutdown_requested.load(Ordering::SeqCst);
        checks.insert("accepting_work".to_owned(), accepting);
        checks.insert("handlers_registered".to_owned(), self.inner.registry.active_count() > 0);
        checks.insert(
            "bulkhead_capacity".to_owned(),
            self.inner.bulkhead.global_utilization() < 1.0,
        );
        let ready = checks.values().all(|ok| *ok);
        ReadinessReport { ready, checks }
    }

    /// Stop admissions, drain, terminate stragglers, flush audit, clear
    /// cache.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("engine shutdown requested");

        let grace_deadline = Instant::now() + self.inner.config.graceful_shutdown_timeout;
        while Instant::now() < grace_deadline {
            if self.lock_active().is_empty() {
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        let leftovers: Vec<String> = self.lock_active().keys().cloned().collect();
        for execution_id in &leftovers {
            self.terminate(execution_id, SHUTDOWN_REASON);
        }
        // Terminated executions unwind quickly; bound the wait anyway.
        let reap_deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < reap_deadline && !self.lock_active().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.inner.audit.shutdown().await;
        self.inner.cache.clear().await;
        self.inner.cache.shutdown();
        tracing::info!("engine shutdown complete");
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, ActiveRecord>> {
        self.inner.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cache_key(&self, ctx: &ExecutionContext) -> Result<CacheKey, EngineError> {
        let definition = self.resolve_definition(ctx)?;
        Ok(CacheKey::new(
            &ctx.tenant_id,
            &ctx.intent.id,
            &definition.name,
            &ctx.intent.context,
        ))
    }

    fn resolve_definition(&self, ctx: &ExecutionContext) -> Result<HandlerDefinition, EngineError> {
        if let Some(name) = &ctx.handler_name {
            let (definition, status) = self
                .inner
                .registry
                .definition(name)
                .ok_or_else(|| EngineError::not_found("handler", name.clone()))?;
            return match status {
                HandlerStatus::Active | HandlerStatus::Degraded => Ok(definition),
                HandlerStatus::Draining | HandlerStatus::Inactive => Err(EngineError::conflict(
                    format!("handler '{name}' is not accepting work"),
                )),
            };
        }

        let intent_type = ctx.intent.intent_type.as_deref().unwrap_or("default");
        let priority = (ctx.priority > 0).then_some(ctx.priority);
        self.inner
            .registry
            .resolve(intent_type, priority)
            .ok_or_else(|| EngineError::not_found("handler for intent type", intent_type))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_admitted(
        &self,
        ctx: &ExecutionContext,
        definition: &HandlerDefinition,
        effective: ResourceLimits,
        started_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        effective_timeout: Duration,
        token: CancellationToken,
        paused: Arc<AtomicBool>,
        terminate_reason: Arc<Mutex<Option<String>>>,
    ) -> Result<ExecutionResult, EngineError> {
        let handler_name = &definition.name;

        let slots = match self.inner.bulkhead.acquire(&ctx.tenant_id, handler_name).await {
            Ok(token) => token,
            Err(err) => {
                self.inner.audit.record(
                    AuditEntry::new(
                        ctx.tenant_id.clone(),
                        ctx.execution_id.clone(),
                        ctx.intent.id.clone(),
                        AuditEventType::ExecutionFailed,
                    )
                    .severity(Severity::Warning)
                    .outcome(AuditOutcome::Failure)
                    .reason(err.to_string())
                    .handler(handler_name.clone()),
                );
                return Err(err);
            }
        };
        let _in_flight = self.inner.registry.begin_execution(handler_name);

        let (monitor, mut signals) = ResourceMonitor::start(
            ctx.execution_id.clone(),
            effective,
            self.inner.config.monitor,
            Arc::clone(&self.inner.sampler),
            token.clone(),
        );
        self.drain_threshold_signals(ctx, handler_name, &mut signals);

        {
            let mut active = self.lock_active();
            if let Some(record) = active.get_mut(&ctx.execution_id) {
                record.state = ExecutionStatus::Running;
                record.monitor = Some(monitor.clone());
            }
        }

        // Deadline timer trips the same handle as terminate/external
        // cancellation; the final `token.cancel()` in execute() reaps it.
        {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(effective_timeout) => token.cancel(),
                    _ = token.cancelled() => {}
                }
            });
        }

        self.inner.audit.record(
            AuditEntry::new(
                ctx.tenant_id.clone(),
                ctx.execution_id.clone(),
                ctx.intent.id.clone(),
                AuditEventType::ExecutionStarted,
            )
            .handler(handler_name.clone())
            .trace(ctx.trace_id.clone(), ctx.span_id.clone()),
        );

        let verdict = self
            .attempt_loop(
                ctx,
                definition,
                &effective,
                deadline,
                effective_timeout,
                &token,
                &paused,
                &terminate_reason,
                &monitor,
            )
            .await;

        let usage = monitor.stop();
        let finished_at = Utc::now();
        let wall_time_ms = usage.wall_ms;
        let (status, outputs, error, retry_count) = match verdict {
            Verdict::Completed { outputs, retries } => {
                (ExecutionStatus::Completed, outputs, None, retries)
            }
            Verdict::Failed { error, retries } => {
                let status = ExecutionStatus::for_error(&error);
                (status, serde_json::Map::new(), Some(error), retries)
            }
        };

        self.record_terminal_audit(ctx, handler_name, status, &usage, error.as_ref());
        slots.release();

        Ok(ExecutionResult {
            execution_id: ctx.execution_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            intent_id: ctx.intent.id.clone(),
            handler_name: handler_name.clone(),
            status,
            outputs,
            usage,
            error: error.as_ref().map(ErrorRecord::from),
            retry_count,
            started_at,
            finished_at,
            wall_time_ms,
            from_cache: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        ctx: &ExecutionContext,
        definition: &HandlerDefinition,
        effective: &ResourceLimits,
        deadline: DateTime<Utc>,
        effective_timeout: Duration,
        token: &CancellationToken,
        paused: &Arc<AtomicBool>,
        terminate_reason: &Arc<Mutex<Option<String>>>,
        monitor: &ResourceMonitor,
    ) -> Verdict {
        let handler_name = &definition.name;
        let breaker = self.inner.breakers.get_or_create(&format!("cognigate-handler-{handler_name}"));
        let retry_policy = definition.retry_policy.clone();
        let max_retries = retry_policy
            .as_ref()
            .map(|policy| policy.max_retries.min(effective.max_retries))
            .unwrap_or(0);

        let mut retries: u32 = 0;
        loop {
            if token.is_cancelled() {
                let error = self.classify_cancellation(
                    terminate_reason,
                    monitor,
                    deadline,
                    effective_timeout,
                );
                return Verdict::Failed { error, retries };
            }

            let attempt_outcome = breaker
                .run(|| {
                    let handler = Arc::clone(&definition.handler);
                    let intent = ctx.intent.clone();
                    let handler_ctx = HandlerContext::new(
                        ctx.execution_id.clone(),
                        ctx.tenant_id.clone(),
                        retries,
                        ctx.metadata.clone(),
                        token.clone(),
                        Arc::clone(paused),
                        monitor.clone(),
                    );
                    let token = token.clone();
                    async move {
                        tokio::select! {
                            output = handler.run(intent, handler_ctx) => {
                                output.map_err(EngineError::from)
                            }
                            _ = token.cancelled() => Err(EngineError::terminated("cancelled")),
                        }
                    }
                })
                .await;

            let error = match attempt_outcome {
                Ok(outputs) => {
                    // Post-attempt enforcement pass.
                    if let Some(violation) = monitor.check() {
                        violation_to_error(violation, effective_timeout)
                    } else {
                        return Verdict::Completed { outputs, retries };
                    }
                }
                Err(CircuitError::Open { retry_after, .. }) => {
                    self.inner.registry.mark_degraded(handler_name);
                    self.inner.audit.record(
                        AuditEntry::new(
                            ctx.tenant_id.clone(),
                            ctx.execution_id.clone(),
                            ctx.intent.id.clone(),
                            AuditEventType::HandlerDegraded,
                        )
                        .severity(Severity::Warning)
                        .outcome(AuditOutcome::Failure)
                        .handler(handler_name.clone())
                        .reason("circuit open"),
                    );
                    let error = EngineError::circuit_open(
                        format!("cognigate-handler-{handler_name}"),
                        retry_after,
                    );
                    return Verdict::Failed { error, retries };
                }
                Err(CircuitError::Inner(err)) => {
                    // A cancellation-raced attempt classifies by cause.
                    if err.is_terminated() && token.is_cancelled() {
                        self.classify_cancellation(
                            terminate_reason,
                            monitor,
                            deadline,
                            effective_timeout,
                        )
                    } else {
                        err
                    }
                }
            };

            let policy = match retry_policy.as_ref() {
                Some(policy) if retries < max_retries && policy.allows(&error) => policy,
                _ => return Verdict::Failed { error, retries },
            };

            retries += 1;
            {
                let mut active = self.lock_active();
                if let Some(record) = active.get_mut(&ctx.execution_id) {
                    record.retry_count = retries;
                }
            }

            let delay = self.inner.jitter.apply(policy.backoff_delay(retries));
            self.inner.audit.record(
                AuditEntry::new(
                    ctx.tenant_id.clone(),
                    ctx.execution_id.clone(),
                    ctx.intent.id.clone(),
                    AuditEventType::RetryAttempted,
                )
                .severity(Severity::Warning)
                .outcome(AuditOutcome::Partial)
                .handler(handler_name.clone())
                .reason(format!("attempt {retries} after {}", error.code())),
            );
            tracing::debug!(
                execution_id = %ctx.execution_id,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                code = error.code(),
                "retrying after backoff"
            );

            // Backoff honors cancellation: a tripped handle aborts the
            // sleep and the loop head classifies it.
            tokio::select! {
                _ = self.inner.sleeper.sleep(delay) => {}
                _ = token.cancelled() => {}
            }
        }
    }

    fn classify_cancellation(
        &self,
        terminate_reason: &Arc<Mutex<Option<String>>>,
        monitor: &ResourceMonitor,
        deadline: DateTime<Utc>,
        effective_timeout: Duration,
    ) -> EngineError {
        if let Some(reason) = terminate_reason.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return EngineError::terminated(reason);
        }
        if let Some(violation) = monitor.violation() {
            return violation_to_error(violation, effective_timeout);
        }
        let now = Utc::now();
        if now + chrono::Duration::milliseconds(5) >= deadline {
            let elapsed = effective_timeout
                + (now - deadline).to_std().unwrap_or(Duration::ZERO);
            return EngineError::timeout(elapsed, effective_timeout);
        }
        EngineError::terminated("cancelled by external signal")
    }

    fn drain_threshold_signals(
        &self,
        ctx: &ExecutionContext,
        handler_name: &str,
        signals: &mut tokio::sync::mpsc::UnboundedReceiver<ThresholdSignal>,
    ) {
        let audit = self.inner.audit.clone();
        let tenant = ctx.tenant_id.clone();
        let execution = ctx.execution_id.clone();
        let intent = ctx.intent.id.clone();
        let handler = handler_name.to_owned();
        let mut signals = std::mem::replace(signals, tokio::sync::mpsc::unbounded_channel().1);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let severity = match signal.level {
                    ThresholdLevel::Warning => Severity::Warning,
                    ThresholdLevel::Critical => Severity::Critical,
                };
                audit.record(
                    AuditEntry::new(
                        tenant.clone(),
                        execution.clone(),
                        intent.clone(),
                        AuditEventType::ResourceWarning,
                    )
                    .severity(severity)
                    .outcome(AuditOutcome::Partial)
                    .handler(handler.clone())
                    .usage(signal.usage)
                    .reason(format!(
                        "{} at {:.0}% of limit",
                        signal.kind.resource(),
                        signal.fraction * 100.0
                    )),
                );
            }
        });
    }

    fn record_terminal_audit(
        &self,
        ctx: &ExecutionContext,
        handler_name: &str,
        status: ExecutionStatus,
        usage: &ResourceUsage,
        error: Option<&EngineError>,
    ) {
        let (event_type, severity, outcome) = match status {
            ExecutionStatus::Completed => {
                (AuditEventType::ExecutionCompleted, Severity::Info, AuditOutcome::Success)
            }
            ExecutionStatus::TimedOut => {
                (AuditEventType::ExecutionTimedOut, Severity::Warning, AuditOutcome::Failure)
            }
            ExecutionStatus::Terminated => {
                (AuditEventType::ExecutionTerminated, Severity::Warning, AuditOutcome::Terminated)
            }
            ExecutionStatus::ResourceExceeded => {
                (AuditEventType::ResourceBreach, Severity::Critical, AuditOutcome::Failure)
            }
            _ => (AuditEventType::ExecutionFailed, Severity::Error, AuditOutcome::Failure),
        };

        let mut entry = AuditEntry::new(
            ctx.tenant_id.clone(),
            ctx.execution_id.clone(),
            ctx.intent.id.clone(),
            event_type,
        )
        .severity(severity)
        .outcome(outcome)
        .handler(handler_name.to_owned())
        .usage(*usage)
        .trace(ctx.trace_id.clone(), ctx.span_id.clone());

        if let Some(error) = error {
            entry = entry.reason(error.to_string());
            if let Some(violation) = error.violation() {
                entry = entry.violation(violation.clone());
            }
        }
        self.inner.audit.record(entry);
    }
}

enum Verdict {
    Completed { outputs: serde_json::Map<String, serde_json::Value>, retries: u32 },
    Failed { error: EngineError, retries: u32 },
}

/// Wall-clock breaches surface as timeouts; every other dimension is a
/// resource-exceeded failure.
fn violation_to_error(
    violation: crate::limits::Violation,
    effective_timeout: Duration,
) -> EngineError {
    if violation.kind == crate::limits::ViolationKind::WallClock {
        EngineError::timeout(Duration::from_millis(violation.actual), effective_timeout)
    } else {
        EngineError::resource_exhausted(violation)
    }
}

fn map_registry_error(err: RegistryError) -> EngineError {
    match err {
        RegistryError::Duplicate(name) => {
            EngineError::conflict(format!("handler already registered: {name}"))
        }
        RegistryError::NotFound(name) => EngineError::not_found("handler", name),
        other => EngineError::validation("HANDLER_INVALID", other.to_string()),
    }
}
