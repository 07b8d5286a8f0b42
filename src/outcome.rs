//! Execution status, results, and the active-execution snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ErrorKind};
use crate::limits::ResourceUsage;

/// Lifecycle state of one execution. Exactly one terminal state is
/// reached before the tracking record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Terminated,
    TimedOut,
    ResourceExceeded,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Terminated
                | Self::TimedOut
                | Self::ResourceExceeded
        )
    }

    /// Terminal status for a failed execution, per the engine's mapping
    /// table.
    pub fn for_error(err: &EngineError) -> Self {
        match err.kind() {
            ErrorKind::Timeout => Self::TimedOut,
            ErrorKind::ResourceExhausted => Self::ResourceExceeded,
            ErrorKind::Terminated => Self::Terminated,
            _ => Self::Failed,
        }
    }
}

/// Serializable error envelope stored on results and audit entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<&EngineError> for ErrorRecord {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code().to_owned(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            timestamp: err.timestamp(),
        }
    }
}

/// Structured record of one finished execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub tenant_id: String,
    pub intent_id: String,
    pub handler_name: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub usage: ResourceUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub wall_time_ms: u64,
    /// Set when the result was served from the idempotence cache rather
    /// than a handler invocation.
    #[serde(default)]
    pub from_cache: bool,
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Read-only snapshot of a tracked in-flight execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveExecution {
    pub execution_id: String,
    pub tenant_id: String,
    pub intent_id: String,
    pub handler_name: String,
    pub state: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub usage: ResourceUsage,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{Violation, ViolationKind};
    use std::time::Duration;

    #[test]
    fn terminal_states() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert!(ExecutionStatus::ResourceExceeded.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(!ExecutionStatus::Initializing.is_terminal());
    }

    #[test]
    fn error_to_status_mapping() {
        let timeout = EngineError::timeout(Duration::from_millis(101), Duration::from_millis(100));
        assert_eq!(ExecutionStatus::for_error(&timeout), ExecutionStatus::TimedOut);

        let violation = Violation::new(ViolationKind::Memory, 512, 600, "e");
        let exhausted = EngineError::resource_exhausted(violation);
        assert_eq!(ExecutionStatus::for_error(&exhausted), ExecutionStatus::ResourceExceeded);

        let terminated = EngineError::terminated("operator request");
        assert_eq!(ExecutionStatus::for_error(&terminated), ExecutionStatus::Terminated);

        let handler = EngineError::handler(None, "boom");
        assert_eq!(ExecutionStatus::for_error(&handler), ExecutionStatus::Failed);

        let denied = EngineError::denied("deny");
        assert_eq!(ExecutionStatus::for_error(&denied), ExecutionStatus::Failed);
    }

    #[test]
    fn error_record_captures_envelope() {
        let err = EngineError::handler(Some("ECONNRESET".into()), "connection reset");
        let record = ErrorRecord::from(&err);
        assert_eq!(record.code, "ECONNRESET");
        assert_eq!(record.kind, ErrorKind::Handler);
        assert!(record.retryable);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::ResourceExceeded).unwrap();
        assert_eq!(json, "\"resource_exceeded\"");
    }
}
