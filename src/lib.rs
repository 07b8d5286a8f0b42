#![forbid(unsafe_code)]

//! # CogniGate
//!
//! A constrained execution runtime that sits between a policy-decision
//! layer and a proof/evidence layer: it receives approved intents and
//! runs them through tenant-isolated, resource-capped handlers,
//! producing a structured execution record and a tamper-aware audit
//! trail.
//!
//! ## Features
//!
//! - **Admission control** via nested bulkheads (global / tenant /
//!   handler) with bounded FIFO wait queues
//! - **Handler registry** with health probes, drain, and deterministic
//!   resolution by intent type
//! - **Per-execution lifecycle**: deadlines, cooperative pause,
//!   terminate, retry with backoff + jitter, cancellation propagation
//! - **Two-tier idempotence cache** keyed by a stable context
//!   fingerprint
//! - **Distributed locks** with TTL leases and token-owned release
//! - **Audit buffer** with batched, circuit-breaker-guarded persistence
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use cognigate::{
//!     Decision, ExecutionContext, ExecutionEngine, HandlerDefinition, HandlerOutput, Intent,
//!     TrustLevel, handler_fn,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = ExecutionEngine::builder().build();
//!
//!     let echo = handler_fn(|intent: Intent, _ctx| async move {
//!         let mut out = HandlerOutput::new();
//!         out.insert("echoed".into(), serde_json::Value::String(intent.id));
//!         Ok(out)
//!     });
//!     engine.register_handler(
//!         HandlerDefinition::new("echo", "1.0.0", echo).intent_type("demo.echo"),
//!     )?;
//!
//!     let ctx = ExecutionContext::builder(
//!         "exec-1",
//!         Intent::new("intent-1", "acme").with_type("demo.echo"),
//!         Decision::allow(0.9, TrustLevel::High),
//!     )
//!     .build();
//!
//!     let result = engine.execute(ctx).await?;
//!     assert!(result.is_completed());
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

mod audit;
mod backoff;
mod bulkhead;
mod cache;
mod circuit_breaker;
mod circuit_breaker_registry;
mod context;
mod engine;
mod error;
mod handler;
mod health;
mod intent;
mod jitter;
mod limits;
mod lock;
mod monitor;
mod outcome;
mod queue;
mod registry;
mod repository;
mod store;
mod time;

// Re-exports
pub use audit::{
    AuditBuffer, AuditConfig, AuditEntry, AuditEventType, AuditOutcome, AuditQuery, AuditSink,
    MemoryAuditSink, Severity, SinkError, TracingAuditSink,
};
pub use backoff::Backoff;
pub use bulkhead::{
    Bulkhead, BulkheadConfig, BulkheadStats, BulkheadToken, GroupLimits, GroupStats,
};
pub use cache::{context_fingerprint, CacheConfig, CacheKey, CacheStats, ExecutionCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use context::{ExecutionContext, ExecutionContextBuilder, MAX_PRIORITY};
pub use engine::{EngineConfig, ExecutionEngine, ExecutionEngineBuilder};
pub use error::{EngineError, ErrorKind, RejectReason};
pub use handler::{
    handler_fn, probe_fn, Handler, HandlerContext, HandlerError, HandlerOutput, HealthProbe,
    RetryPolicy, RetryPolicyError,
};
pub use health::{HealthCheck, HealthReport, HealthStatus, ReadinessReport};
pub use intent::{Decision, DecisionAction, Intent, TrustLevel};
pub use jitter::Jitter;
pub use limits::{
    LimitOverrides, LimitsError, ResourceLimits, ResourceUsage, Violation, ViolationKind,
};
pub use lock::{Lock, LockOptions, LockService, MAX_LOCK_TTL, MIN_LOCK_TTL};
pub use monitor::{
    MonitorConfig, NoopSampler, ProcessSample, ProcessSampler, ResourceMonitor, ThresholdLevel,
    ThresholdSignal,
};
pub use outcome::{ActiveExecution, ErrorRecord, ExecutionResult, ExecutionStatus};
pub use queue::{
    processor_fn, DeadLetter, ExecutionJob, ExecutionQueue, JobProcessor, QueueConfig, QueueError,
    QueueStats,
};
pub use registry::{
    HandlerDefinition, HandlerRegistry, HandlerSnapshot, HandlerStatus, RegistryError,
};
pub use repository::{
    ExecutionRepository, InMemoryRepository, RepositoryAuditSink, RepositoryError,
};
pub use store::{DistributedStore, MemoryStore, StoreError};
pub use time::{Clock, InstantSleeper, ManualClock, MonotonicClock, Sleeper, TokioSleeper, TrackingSleeper};

pub mod prelude;
