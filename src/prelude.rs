//! Convenient re-exports for common CogniGate types.
pub use crate::{
    audit::{AuditBuffer, AuditConfig, AuditEntry, AuditEventType, AuditOutcome, AuditSink, Severity},
    bulkhead::{Bulkhead, BulkheadConfig, GroupLimits},
    cache::{CacheConfig, CacheKey, ExecutionCache},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    context::ExecutionContext,
    engine::{EngineConfig, ExecutionEngine},
    error::{EngineError, ErrorKind},
    handler::{handler_fn, Handler, HandlerContext, HandlerError, HandlerOutput, RetryPolicy},
    intent::{Decision, DecisionAction, Intent, TrustLevel},
    limits::{LimitOverrides, ResourceLimits, ResourceUsage},
    lock::{Lock, LockOptions, LockService},
    outcome::{ExecutionResult, ExecutionStatus},
    queue::{processor_fn, ExecutionJob, ExecutionQueue, QueueConfig},
    registry::{HandlerDefinition, HandlerRegistry, HandlerStatus},
    store::{DistributedStore, MemoryStore},
};
