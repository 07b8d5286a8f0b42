//! Append-only audit trail: non-blocking buffer, batched flush, bounded
//! backpressure.
//!
//! `record` never blocks the execution path. A background task drains
//! batches into the sink every flush interval, or sooner once a batch's
//! worth of entries is buffered. The sink call is circuit-breaker
//! guarded; a failed batch is re-prepended for retry unless doing so
//! would overflow the buffer. Ordering is best-effort FIFO and
//! duplicates are possible on retry, so consumers must be idempotent by
//! entry id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::limits::{ResourceUsage, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Partial,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionTimedOut,
    ExecutionTerminated,
    ExecutionPaused,
    ExecutionResumed,
    RetryAttempted,
    ResourceWarning,
    ResourceBreach,
    HandlerDegraded,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionTimedOut => "execution_timed_out",
            Self::ExecutionTerminated => "execution_terminated",
            Self::ExecutionPaused => "execution_paused",
            Self::ExecutionResumed => "execution_resumed",
            Self::RetryAttempted => "retry_attempted",
            Self::ResourceWarning => "resource_warning",
            Self::ResourceBreach => "resource_breach",
            Self::HandlerDegraded => "handler_degraded",
        }
    }
}

/// One lifecycle event or policy signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub execution_id: String,
    pub intent_id: String,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub outcome: AuditOutcome,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub event_time: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        tenant_id: impl Into<String>,
        execution_id: impl Into<String>,
        intent_id: impl Into<String>,
        event_type: AuditEventType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            execution_id: execution_id.into(),
            intent_id: intent_id.into(),
            event_type,
            severity: Severity::Info,
            outcome: AuditOutcome::Success,
            action: event_type.as_str().to_owned(),
            reason: None,
            handler_name: None,
            usage: None,
            violation: None,
            trace_id: None,
            span_id: None,
            event_time: now,
            recorded_at: now,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn handler(mut self, handler_name: impl Into<String>) -> Self {
        self.handler_name = Some(handler_name.into());
        self
    }

    pub fn usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn violation(mut self, violation: Violation) -> Self {
        self.violation = Some(violation);
        self
    }

    pub fn trace(mut self, trace_id: Option<String>, span_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self.span_id = span_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("audit sink failure: {0}")]
pub struct SinkError(pub String);

/// Persistence seam for drained batches. Consumers must treat entry ids
/// idempotently: the same id may arrive more than once.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn persist(&self, entries: &[AuditEntry]) -> Result<(), SinkError>;
}

/// Test/in-process sink. Deduplicates by entry id, which is exactly the
/// idempotence the buffer's retry semantics require of real consumers.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
    fail: Arc<AtomicBool>,
    persist_calls: Arc<AtomicU64>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn persist_calls(&self) -> u64 {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn entries_for_execution(&self, execution_id: &str) -> Vec<AuditEntry> {
        self.entries().into_iter().filter(|e| e.execution_id == execution_id).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn persist(&self, batch: &[AuditEntry]) -> Result<(), SinkError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError("injected failure".into()));
        }
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        for entry in batch {
            if !entries.iter().any(|existing| existing.id == entry.id) {
                entries.push(entry.clone());
            }
        }
        Ok(())
    }
}

/// Sink that emits each entry as a structured tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn persist(&self, batch: &[AuditEntry]) -> Result<(), SinkError> {
        for entry in batch {
            tracing::info!(
                audit_id = %entry.id,
                tenant = %entry.tenant_id,
                execution = %entry.execution_id,
                event = entry.event_type.as_str(),
                severity = ?entry.severity,
                "audit"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub max_buffer_size: usize,
    pub shutdown_flush_retries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            batch_size: 50,
            max_buffer_size: 10_000,
            shutdown_flush_retries: 5,
        }
    }
}

/// Filter for reading back buffered (not yet flushed) entries.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub tenant_id: Option<String>,
    pub execution_id: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub limit: Option<usize>,
}

/// Bounded, batching audit buffer; see the module docs.
#[derive(Clone)]
pub struct AuditBuffer {
    config: AuditConfig,
    buffer: Arc<Mutex<VecDeque<AuditEntry>>>,
    sink: Arc<dyn AuditSink>,
    breaker: CircuitBreaker,
    flushing: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    kick: Arc<Notify>,
    stop: CancellationToken,
}

impl std::fmt::Debug for AuditBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditBuffer")
            .field("buffered", &self.len())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl AuditBuffer {
    pub fn new(config: AuditConfig, sink: Arc<dyn AuditSink>) -> Self {
        let buffer = Self {
            config,
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            sink,
            breaker: CircuitBreaker::new("cognigate-audit-sink", CircuitBreakerConfig::default()),
            flushing: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            kick: Arc::new(Notify::new()),
            stop: CancellationToken::new(),
        };

        if tokio::runtime::Handle::try_current().is_ok() {
            let flusher = buffer.clone();
            let stop = buffer.stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = flusher.kick.notified() => {}
                        _ = tokio::time::sleep(flusher.config.flush_interval) => {}
                    }
                    flusher.flush().await;
                }
            });
        }
        buffer
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AuditEntry>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Non-blocking append. Oldest entries are dropped (with a warning)
    /// when the buffer is full.
    pub fn record(&self, entry: AuditEntry) {
        let should_kick = {
            let mut buffer = self.lock();
            if buffer.len() >= self.config.max_buffer_size {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("audit buffer full; dropped oldest entry");
            }
            buffer.push_back(entry);
            buffer.len() >= self.config.batch_size
        };
        if should_kick {
            self.kick.notify_one();
        }
    }

    /// Drain and persist one batch. Serialized by the flushing flag so
    /// batches stay ordered; a concurrent flush waits its turn rather
    /// than silently skipping.
    pub async fn flush(&self) {
        while self.flushing.swap(true, Ordering::AcqRel) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let batch: Vec<AuditEntry> = {
            let mut buffer = self.lock();
            let take = buffer.len().min(self.config.batch_size);
            buffer.drain(..take).collect()
        };

        if !batch.is_empty() {
            let outcome = self
                .breaker
                .run(|| {
                    let sink = Arc::clone(&self.sink);
                    let batch = batch.clone();
                    async move { sink.persist(&batch).await }
                })
                .await;

            if let Err(err) = outcome {
                tracing::warn!(%err, batch = batch.len(), "audit flush failed; re-buffering batch");
                let mut buffer = self.lock();
                if buffer.len() + batch.len() <= self.config.max_buffer_size {
                    for entry in batch.into_iter().rev() {
                        buffer.push_front(entry);
                    }
                } else {
                    self.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    tracing::warn!(
                        dropped = batch.len(),
                        "audit buffer cannot absorb failed batch; dropping it"
                    );
                }
            }
        }

        self.flushing.store(false, Ordering::Release);
    }

    /// Read back buffered entries. The buffer is a valid source for
    /// entries not yet flushed; flushed history lives at the sink.
    pub fn recent(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let buffer = self.lock();
        let mut entries: Vec<AuditEntry> = buffer
            .iter()
            .filter(|e| query.tenant_id.as_deref().map_or(true, |t| e.tenant_id == t))
            .filter(|e| query.execution_id.as_deref().map_or(true, |id| e.execution_id == id))
            .filter(|e| query.event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the periodic flusher, then try to empty the buffer with a
    /// bounded number of flushes, logging whatever remains.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        for _ in 0..self.config.shutdown_flush_retries {
            if self.is_empty() {
                break;
            }
            self.flush().await;
        }
        let residual = self.len();
        if residual > 0 {
            tracing::warn!(residual, "audit shutdown left unflushed entries");
        }
    }
}
