//! Error taxonomy for the execution runtime.
//!
//! One tagged sum with a common envelope: every error carries a stable
//! code, a human message, a timestamp, and optional structured context.
//! Retry decisions live in the engine and key off [`EngineError::is_retryable`];
//! upstream callers must not re-retry.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::limits::Violation;

/// Coarse error classification. Maps 1:1 to an HTTP status at the (out
/// of scope) API boundary; the core emits the kind, not a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Timeout,
    Terminated,
    ResourceExhausted,
    BulkheadRejected,
    RateLimited,
    SandboxViolation,
    Handler,
    Database,
    CircuitOpen,
}

/// Why a bulkhead turned an execution away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Wait queue was already at capacity.
    QueueFull,
    /// Waited, but the queue timeout elapsed first.
    QueueTimeout,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue-full"),
            Self::QueueTimeout => write!(f, "queue-timeout"),
        }
    }
}

#[derive(Debug, Clone)]
enum Detail {
    Validation { code: &'static str, message: String },
    NotFound { entity: &'static str, id: String },
    Conflict { message: String },
    Timeout { elapsed: Duration, limit: Duration },
    Terminated { reason: String },
    ResourceExhausted { violation: Violation },
    BulkheadRejected { scope: String, reason: RejectReason },
    RateLimited { retry_after: Duration },
    SandboxViolation { message: String },
    Handler { code: Option<String>, message: String, operational: bool },
    Database { message: String },
    CircuitOpen { circuit: String, reset_in: Duration },
}

/// Unified error for every operation the runtime exposes.
#[derive(Debug, Clone)]
pub struct EngineError {
    detail: Detail,
    timestamp: DateTime<Utc>,
    context: Option<serde_json::Value>,
    retryable_override: Option<bool>,
}

impl EngineError {
    fn new(detail: Detail) -> Self {
        Self { detail, timestamp: Utc::now(), context: None, retryable_override: None }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(Detail::Validation { code, message: message.into() })
    }

    /// Context rejected because the upstream decision was not `allow`.
    pub fn denied(action: impl fmt::Display) -> Self {
        Self::new(Detail::Validation {
            code: "EXECUTION_DENIED",
            message: format!("decision action '{action}' does not permit execution"),
        })
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::new(Detail::NotFound { entity, id: id.into() })
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Detail::Conflict { message: message.into() })
    }

    pub fn timeout(elapsed: Duration, limit: Duration) -> Self {
        Self::new(Detail::Timeout { elapsed, limit })
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self::new(Detail::Terminated { reason: reason.into() })
    }

    pub fn resource_exhausted(violation: Violation) -> Self {
        Self::new(Detail::ResourceExhausted { violation })
    }

    pub fn bulkhead_rejected(scope: impl Into<String>, reason: RejectReason) -> Self {
        Self::new(Detail::BulkheadRejected { scope: scope.into(), reason })
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::new(Detail::RateLimited { retry_after })
    }

    pub fn sandbox_violation(message: impl Into<String>) -> Self {
        Self::new(Detail::SandboxViolation { message: message.into() })
    }

    /// Operational handler failure (transient by assumption, retryable).
    pub fn handler(code: Option<String>, message: impl Into<String>) -> Self {
        Self::new(Detail::Handler { code, message: message.into(), operational: true })
    }

    /// Programmer-bug handler failure. Logged verbosely, sanitized at the
    /// boundary, never retried.
    pub fn handler_bug(message: impl Into<String>) -> Self {
        Self::new(Detail::Handler { code: None, message: message.into(), operational: false })
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(Detail::Database { message: message.into() })
    }

    pub fn circuit_open(circuit: impl Into<String>, reset_in: Duration) -> Self {
        Self::new(Detail::CircuitOpen { circuit: circuit.into(), reset_in })
    }

    /// Attach structured context (never a stack trace on the wire).
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Force the retryable flag, used when an unknown failure is mapped to
    /// `failed` but the caller may still re-submit.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable_override = Some(retryable);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.detail {
            Detail::Validation { .. } => ErrorKind::Validation,
            Detail::NotFound { .. } => ErrorKind::NotFound,
            Detail::Conflict { .. } => ErrorKind::Conflict,
            Detail::Timeout { .. } => ErrorKind::Timeout,
            Detail::Terminated { .. } => ErrorKind::Terminated,
            Detail::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Detail::BulkheadRejected { .. } => ErrorKind::BulkheadRejected,
            Detail::RateLimited { .. } => ErrorKind::RateLimited,
            Detail::SandboxViolation { .. } => ErrorKind::SandboxViolation,
            Detail::Handler { .. } => ErrorKind::Handler,
            Detail::Database { .. } => ErrorKind::Database,
            Detail::CircuitOpen { .. } => ErrorKind::CircuitOpen,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &str {
        match &self.detail {
            Detail::Validation { code, .. } => code,
            Detail::NotFound { .. } => "NOT_FOUND",
            Detail::Conflict { .. } => "CONFLICT",
            Detail::Timeout { .. } => "EXECUTION_TIMEOUT",
            Detail::Terminated { .. } => "EXECUTION_TERMINATED",
            Detail::ResourceExhausted { .. } => "RESOURCE_EXCEEDED",
            Detail::BulkheadRejected { .. } => "BULKHEAD_REJECTED",
            Detail::RateLimited { .. } => "RATE_LIMITED",
            Detail::SandboxViolation { .. } => "SANDBOX_VIOLATION",
            Detail::Handler { code, .. } => code.as_deref().unwrap_or("HANDLER_ERROR"),
            Detail::Database { .. } => "DATABASE_ERROR",
            Detail::CircuitOpen { .. } => "CIRCUIT_OPEN",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn context(&self) -> Option<&serde_json::Value> {
        self.context.as_ref()
    }

    /// Whether the engine's retry loop may re-run the attempt.
    pub fn is_retryable(&self) -> bool {
        if let Some(forced) = self.retryable_override {
            return forced;
        }
        match &self.detail {
            Detail::Handler { operational, .. } => *operational,
            Detail::Database { .. } => true,
            _ => false,
        }
    }

    /// Whether the failure is expected-in-operation (vs a programmer bug
    /// that must be sanitized at the boundary).
    pub fn is_operational(&self) -> bool {
        match &self.detail {
            Detail::Handler { operational, .. } => *operational,
            _ => true,
        }
    }

    /// Hint for callers hitting an open circuit or a rate limit.
    pub fn retry_after(&self) -> Option<Duration> {
        match &self.detail {
            Detail::RateLimited { retry_after } => Some(*retry_after),
            Detail::CircuitOpen { reset_in, .. } => Some(*reset_in),
            _ => None,
        }
    }

    /// The violation that tripped a resource-exhausted error, if any.
    pub fn violation(&self) -> Option<&Violation> {
        match &self.detail {
            Detail::ResourceExhausted { violation } => Some(violation),
            _ => None,
        }
    }

    /// Case-insensitive match of `pattern` against code and message, used
    /// by retry policies (`retryable_errors` lists).
    pub fn matches(&self, pattern: &str) -> bool {
        let needle = pattern.to_ascii_lowercase();
        self.code().to_ascii_lowercase().contains(&needle)
            || self.to_string().to_ascii_lowercase().contains(&needle)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.detail, Detail::Validation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.detail, Detail::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.detail, Detail::Timeout { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.detail, Detail::Terminated { .. })
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self.detail, Detail::ResourceExhausted { .. })
    }

    pub fn is_bulkhead_rejected(&self) -> bool {
        matches!(self.detail, Detail::BulkheadRejected { .. })
    }

    pub fn is_sandbox_violation(&self) -> bool {
        matches!(self.detail, Detail::SandboxViolation { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.detail, Detail::CircuitOpen { .. })
    }

    pub fn is_handler_error(&self) -> bool {
        matches!(self.detail, Detail::Handler { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Detail::Validation { message, .. } => write!(f, "{message}"),
            Detail::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Detail::Conflict { message } => write!(f, "{message}"),
            Detail::Timeout { elapsed, limit } => {
                write!(f, "execution timed out after {elapsed:?} (limit {limit:?})")
            }
            Detail::Terminated { reason } => write!(f, "execution terminated: {reason}"),
            Detail::ResourceExhausted { violation } => {
                write!(f, "resource limit exceeded: {violation}")
            }
            Detail::BulkheadRejected { scope, reason } => {
                write!(f, "bulkhead rejected ({scope}): {reason}")
            }
            Detail::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {retry_after:?}")
            }
            Detail::SandboxViolation { message } => write!(f, "sandbox violation: {message}"),
            Detail::Handler { message, .. } => write!(f, "{message}"),
            Detail::Database { message } => write!(f, "storage failure: {message}"),
            Detail::CircuitOpen { circuit, reset_in } => {
                write!(f, "circuit '{circuit}' open, retry in {reset_in:?}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            EngineError::timeout(Duration::from_secs(1), Duration::from_secs(1)).code(),
            "EXECUTION_TIMEOUT"
        );
        assert_eq!(EngineError::denied("deny").code(), "EXECUTION_DENIED");
        assert_eq!(
            EngineError::bulkhead_rejected("global", RejectReason::QueueFull).code(),
            "BULKHEAD_REJECTED"
        );
        assert_eq!(
            EngineError::circuit_open("cognigate-handler-x", Duration::from_secs(30)).code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(EngineError::handler(Some("ECONNRESET".into()), "reset").code(), "ECONNRESET");
        assert_eq!(EngineError::handler(None, "boom").code(), "HANDLER_ERROR");
    }

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(EngineError::handler(None, "transient").is_retryable());
        assert!(EngineError::database("conn refused").is_retryable());
        assert!(!EngineError::handler_bug("npe").is_retryable());
        assert!(!EngineError::timeout(Duration::ZERO, Duration::ZERO).is_retryable());
        assert!(!EngineError::terminated("op").is_retryable());
        assert!(!EngineError::denied("deny").is_retryable());
        assert!(!EngineError::bulkhead_rejected("g", RejectReason::QueueTimeout).is_retryable());
        assert!(!EngineError::circuit_open("c", Duration::ZERO).is_retryable());
    }

    #[test]
    fn retryable_override_wins() {
        let err = EngineError::handler_bug("unknown").with_retryable(true);
        assert!(err.is_retryable());
    }

    #[test]
    fn pattern_match_is_case_insensitive_over_code_and_message() {
        let err = EngineError::handler(Some("ECONNRESET".into()), "connection reset by peer");
        assert!(err.matches("econnreset"));
        assert!(err.matches("Connection Reset"));
        assert!(!err.matches("etimedout"));
    }

    #[test]
    fn retry_after_hints() {
        let open = EngineError::circuit_open("c", Duration::from_secs(12));
        assert_eq!(open.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(EngineError::conflict("dup").retry_after(), None);
    }

    #[test]
    fn programmer_bugs_are_not_operational() {
        assert!(!EngineError::handler_bug("index out of bounds").is_operational());
        assert!(EngineError::handler(None, "upstream 503").is_operational());
        assert!(EngineError::timeout(Duration::ZERO, Duration::ZERO).is_operational());
    }

    #[test]
    fn display_includes_scope_and_reason_for_bulkhead() {
        let err = EngineError::bulkhead_rejected("tenant:acme", RejectReason::QueueTimeout);
        let msg = err.to_string();
        assert!(msg.contains("tenant:acme"));
        assert!(msg.contains("queue-timeout"));
    }
}
