//! Handler seam: the callable a registered handler provides, the SDK
//! context it runs with, and the retry policy attached to it.
//!
//! Pause is a cooperative contract: the engine flips the paused flag and
//! handlers that poll [`HandlerContext::is_paused`] honor it; handlers
//! that do not are still bounded by the deadline and cancellation.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::error::{EngineError, ErrorKind};
use crate::intent::Intent;
use crate::monitor::ResourceMonitor;

/// Outputs are an opaque JSON mapping, mirroring the intent context.
pub type HandlerOutput = serde_json::Map<String, serde_json::Value>;

/// Failure returned by a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub code: Option<String>,
    pub message: String,
    pub operational: bool,
}

impl HandlerError {
    /// Expected operational failure (eligible for retry).
    pub fn operational(message: impl Into<String>) -> Self {
        Self { code: None, message: message.into(), operational: true }
    }

    /// Operational failure with a stable code such as `ECONNRESET`.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: Some(code.into()), message: message.into(), operational: true }
    }

    /// Programmer bug; never retried, sanitized at the API boundary.
    pub fn bug(message: impl Into<String>) -> Self {
        Self { code: None, message: message.into(), operational: false }
    }
}

impl From<HandlerError> for EngineError {
    fn from(err: HandlerError) -> Self {
        if err.operational {
            EngineError::handler(err.code, err.message)
        } else {
            EngineError::handler_bug(err.message)
        }
    }
}

/// Per-attempt SDK handed to handlers: usage recording, cancellation,
/// pause polling, and the caller-supplied metadata.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    execution_id: String,
    tenant_id: String,
    attempt: u32,
    metadata: serde_json::Map<String, serde_json::Value>,
    cancellation: CancellationToken,
    paused: Arc<AtomicBool>,
    monitor: ResourceMonitor,
}

impl HandlerContext {
    pub(crate) fn new(
        execution_id: impl Into<String>,
        tenant_id: impl Into<String>,
        attempt: u32,
        metadata: serde_json::Map<String, serde_json::Value>,
        cancellation: CancellationToken,
        paused: Arc<AtomicBool>,
        monitor: ResourceMonitor,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            tenant_id: tenant_id.into(),
            attempt,
            metadata,
            cancellation,
            paused,
            monitor,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// 0 on the first attempt, incremented per retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the execution is cancelled (deadline, terminate,
    /// external signal, or shutdown). Cooperative handlers select on it.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Cooperative pause signal; see the module docs.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn record_network(&self, bytes_in: u64, bytes_out: u64) {
        self.monitor.record_network(bytes_in, bytes_out);
    }

    pub fn record_filesystem_read(&self) {
        self.monitor.record_filesystem_read();
    }

    pub fn record_filesystem_write(&self) {
        self.monitor.record_filesystem_write();
    }

    pub fn record_memory(&self, memory_mb: u64) {
        self.monitor.record_memory(memory_mb);
    }

    /// Advisory sub-operation gauge; checked against the hard limit but
    /// not verified by the core.
    pub fn set_concurrent(&self, count: u64) {
        self.monitor.set_concurrent(count);
    }
}

/// A named unit of work. Implementations must be cancellation-aware to
/// be terminated promptly; the engine otherwise abandons the attempt at
/// the deadline.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, intent: Intent, ctx: HandlerContext)
        -> Result<HandlerOutput, HandlerError>;
}

struct FnHandler {
    #[allow(clippy::type_complexity)]
    f: Box<
        dyn Fn(Intent, HandlerContext) -> BoxFuture<'static, Result<HandlerOutput, HandlerError>>
            + Send
            + Sync,
    >,
}

#[async_trait]
impl Handler for FnHandler {
    async fn run(
        &self,
        intent: Intent,
        ctx: HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        (self.f)(intent, ctx).await
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Intent, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f: Box::new(move |intent, ctx| Box::pin(f(intent, ctx))) })
}

/// Liveness probe attached to a handler registration.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn healthy(&self) -> bool;
}

struct FnProbe {
    f: Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>,
}

#[async_trait]
impl HealthProbe for FnProbe {
    async fn healthy(&self) -> bool {
        (self.f)().await
    }
}

/// Wrap an async closure as a [`HealthProbe`].
pub fn probe_fn<F, Fut>(f: F) -> Arc<dyn HealthProbe>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = bool> + Send + 'static,
{
    Arc::new(FnProbe { f: Box::new(move || Box::pin(f())) })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("backoff_ms must be > 0")]
    ZeroBackoff,
    #[error("backoff_multiplier must be >= 1")]
    MultiplierBelowOne,
    #[error("max_backoff_ms must be >= backoff_ms")]
    CapBelowBase,
}

/// Retry behavior a handler opts into. Without a policy the engine runs
/// a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Case-insensitive substrings matched against error code and
    /// message. Empty means: retry anything the taxonomy marks retryable.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.backoff_ms == 0 {
            return Err(RetryPolicyError::ZeroBackoff);
        }
        if self.backoff_multiplier < 1.0 {
            return Err(RetryPolicyError::MultiplierBelowOne);
        }
        if self.max_backoff_ms < self.backoff_ms {
            return Err(RetryPolicyError::CapBelowBase);
        }
        Ok(())
    }

    /// Backoff before retry number `retry` (1-indexed), pre-jitter:
    /// `min(backoff_ms · multiplier^(retry-1), max_backoff_ms)`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        Backoff::exponential_with_multiplier(
            Duration::from_millis(self.backoff_ms),
            self.backoff_multiplier,
        )
        .with_max(Duration::from_millis(self.max_backoff_ms))
        .delay(retry as usize)
    }

    /// Whether this policy allows retrying `err`. Kinds the engine marks
    /// never-retryable are excluded before the pattern match.
    pub fn allows(&self, err: &EngineError) -> bool {
        if !err.is_retryable() {
            return false;
        }
        // These kinds never re-enter the retry loop, pattern match or not.
        if matches!(
            err.kind(),
            ErrorKind::Timeout
                | ErrorKind::Terminated
                | ErrorKind::Validation
                | ErrorKind::SandboxViolation
                | ErrorKind::NotFound
                | ErrorKind::BulkheadRejected
                | ErrorKind::CircuitOpen
        ) {
            return false;
        }
        if self.retryable_errors.is_empty() {
            return true;
        }
        self.retryable_errors.iter().any(|pattern| err.matches(pattern))
    }
}
