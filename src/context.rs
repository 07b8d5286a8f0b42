//! Execution context: everything the engine needs to run one intent.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::intent::{Decision, Intent};
use crate::limits::LimitOverrides;

pub const MAX_PRIORITY: u8 = 10;

/// Per-execution input assembled by the caller. Construct via
/// [`ExecutionContext::builder`]; the engine re-validates on entry.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub tenant_id: String,
    pub intent: Intent,
    pub decision: Decision,
    /// Explicit handler override; wins over intent-type resolution.
    pub handler_name: Option<String>,
    pub limit_overrides: LimitOverrides,
    /// Absolute deadline; the effective deadline is the earlier of this
    /// and `now + effective timeout`.
    pub deadline: Option<DateTime<Utc>>,
    pub parent_execution_id: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub priority: u8,
    /// External cancellation signal, wired into the execution's own token.
    pub cancellation: Option<CancellationToken>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn builder(
        execution_id: impl Into<String>,
        intent: Intent,
        decision: Decision,
    ) -> ExecutionContextBuilder {
        ExecutionContextBuilder {
            execution_id: execution_id.into(),
            tenant_id: intent.tenant_id.clone(),
            intent,
            decision,
            handler_name: None,
            limit_overrides: LimitOverrides::default(),
            deadline: None,
            parent_execution_id: None,
            trace_id: None,
            span_id: None,
            priority: 0,
            cancellation: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Admission-time validation; every rejection is a typed
    /// non-retryable error.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.execution_id.is_empty() {
            return Err(EngineError::validation("CONTEXT_INVALID", "execution_id is required"));
        }
        if self.tenant_id.is_empty() {
            return Err(EngineError::validation("CONTEXT_INVALID", "tenant_id is required"));
        }
        if self.intent.id.is_empty() {
            return Err(EngineError::validation("CONTEXT_INVALID", "intent.id is required"));
        }
        if self.tenant_id != self.intent.tenant_id {
            return Err(EngineError::validation(
                "TENANT_MISMATCH",
                format!(
                    "context tenant '{}' does not match intent tenant '{}'",
                    self.tenant_id, self.intent.tenant_id
                ),
            ));
        }
        if !self.decision.permits_execution() {
            return Err(EngineError::denied(self.decision.action));
        }
        if self.priority > MAX_PRIORITY {
            return Err(EngineError::validation(
                "CONTEXT_INVALID",
                format!("priority {} exceeds maximum {MAX_PRIORITY}", self.priority),
            ));
        }
        if let Some(deadline) = self.deadline {
            if deadline <= Utc::now() {
                return Err(EngineError::validation(
                    "DEADLINE_PASSED",
                    format!("deadline {deadline} is not in the future"),
                ));
            }
        }
        Ok(())
    }
}

pub struct ExecutionContextBuilder {
    execution_id: String,
    tenant_id: String,
    intent: Intent,
    decision: Decision,
    handler_name: Option<String>,
    limit_overrides: LimitOverrides,
    deadline: Option<DateTime<Utc>>,
    parent_execution_id: Option<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
    priority: u8,
    cancellation: Option<CancellationToken>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionContextBuilder {
    pub fn handler(mut self, name: impl Into<String>) -> Self {
        self.handler_name = Some(name.into());
        self
    }

    pub fn limits(mut self, overrides: LimitOverrides) -> Self {
        self.limit_overrides = overrides;
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn parent(mut self, execution_id: impl Into<String>) -> Self {
        self.parent_execution_id = Some(execution_id.into());
        self
    }

    pub fn trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            execution_id: self.execution_id,
            tenant_id: self.tenant_id,
            intent: self.intent,
            decision: self.decision,
            handler_name: self.handler_name,
            limit_overrides: self.limit_overrides,
            deadline: self.deadline,
            parent_execution_id: self.parent_execution_id,
            trace_id: self.trace_id,
            span_id: self.span_id,
            priority: self.priority,
            cancellation: self.cancellation,
            metadata: self.metadata,
        }
    }
}
