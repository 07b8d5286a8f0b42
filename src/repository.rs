//! Persistence boundary for execution records and audit history.
//!
//! The engine only ever talks to this trait; the real schema lives
//! behind it and is out of scope. Every write is idempotent on retry of
//! the same ids, which lets the audit buffer re-send failed batches
//! without duplicating history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audit::{AuditEntry, AuditSink, SinkError};
use crate::outcome::ExecutionResult;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("repository query failed: {0}")]
    Query(String),
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert or overwrite the record for its execution id.
    async fn insert_execution(&self, record: &ExecutionResult) -> Result<(), RepositoryError>;

    /// Update an existing record; returns whether it existed.
    async fn update_execution(&self, record: &ExecutionResult) -> Result<bool, RepositoryError>;

    /// Append a batch of audit entries; returns how many were new
    /// (replayed ids are skipped).
    async fn insert_audit_batch(&self, entries: &[AuditEntry]) -> Result<usize, RepositoryError>;

    /// Soft-delete every record for (tenant, entity); returns the count.
    async fn soft_delete(&self, tenant_id: &str, entity_id: &str)
        -> Result<usize, RepositoryError>;

    /// Permanently remove records by id; returns how many existed.
    async fn hard_delete(&self, ids: &[String]) -> Result<usize, RepositoryError>;

    async fn find_execution(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionResult>, RepositoryError>;

    /// Ids of records soft-deleted before `cutoff`, for purge jobs.
    async fn find_soft_deleted_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, RepositoryError>;

    /// Per-tenant audit history, optionally narrowed to one execution.
    async fn audit_trail(
        &self,
        tenant_id: &str,
        execution_id: Option<&str>,
    ) -> Result<Vec<AuditEntry>, RepositoryError>;
}

#[derive(Debug, Clone)]
struct StoredExecution {
    record: ExecutionResult,
    soft_deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryTables {
    executions: HashMap<String, StoredExecution>,
    audit: Vec<AuditEntry>,
}

/// In-memory repository used by tests and single-node deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    tables: Arc<Mutex<MemoryTables>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn audit_len(&self) -> usize {
        self.lock().audit.len()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn insert_execution(&self, record: &ExecutionResult) -> Result<(), RepositoryError> {
        self.lock().executions.insert(
            record.execution_id.clone(),
            StoredExecution { record: record.clone(), soft_deleted_at: None },
        );
        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionResult) -> Result<bool, RepositoryError> {
        let mut tables = self.lock();
        match tables.executions.get_mut(&record.execution_id) {
            Some(stored) => {
                stored.record = record.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_audit_batch(&self, entries: &[AuditEntry]) -> Result<usize, RepositoryError> {
        let mut tables = self.lock();
        let mut inserted = 0;
        for entry in entries {
            if !tables.audit.iter().any(|existing| existing.id == entry.id) {
                tables.audit.push(entry.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn soft_delete(
        &self,
        tenant_id: &str,
        entity_id: &str,
    ) -> Result<usize, RepositoryError> {
        let mut tables = self.lock();
        let now = Utc::now();
        let mut count = 0;
        for stored in tables.executions.values_mut() {
            if stored.record.tenant_id == tenant_id
                && stored.record.execution_id == entity_id
                && stored.soft_deleted_at.is_none()
            {
                stored.soft_deleted_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn hard_delete(&self, ids: &[String]) -> Result<usize, RepositoryError> {
        let mut tables = self.lock();
        let mut count = 0;
        for id in ids {
            if tables.executions.remove(id).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn find_execution(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionResult>, RepositoryError> {
        let tables = self.lock();
        Ok(tables
            .executions
            .get(execution_id)
            .filter(|stored| stored.record.tenant_id == tenant_id)
            .filter(|stored| stored.soft_deleted_at.is_none())
            .map(|stored| stored.record.clone()))
    }

    async fn find_soft_deleted_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, RepositoryError> {
        let tables = self.lock();
        let mut ids: Vec<String> = tables
            .executions
            .iter()
            .filter(|(_, stored)| stored.soft_deleted_at.is_some_and(|at| at < cutoff))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn audit_trail(
        &self,
        tenant_id: &str,
        execution_id: Option<&str>,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let tables = self.lock();
        Ok(tables
            .audit
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .filter(|entry| execution_id.map_or(true, |id| entry.execution_id == id))
            .cloned()
            .collect())
    }
}

/// Adapter letting a repository serve as the audit buffer's sink.
#[derive(Clone)]
pub struct RepositoryAuditSink {
    repository: Arc<dyn ExecutionRepository>,
}

impl RepositoryAuditSink {
    pub fn new(repository: Arc<dyn ExecutionRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl AuditSink for RepositoryAuditSink {
    async fn persist(&self, entries: &[AuditEntry]) -> Result<(), SinkError> {
        self.repository
            .insert_audit_batch(entries)
            .await
            .map(|_| ())
            .map_err(|err| SinkError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventType;
    use crate::limits::ResourceUsage;
    use crate::outcome::ExecutionStatus;
    use chrono::Duration as ChronoDuration;

    fn record(execution_id: &str, tenant: &str) -> ExecutionResult {
        ExecutionResult {
            execution_id: execution_id.into(),
            tenant_id: tenant.into(),
            intent_id: "i-1".into(),
            handler_name: "h".into(),
            status: ExecutionStatus::Completed,
            outputs: serde_json::Map::new(),
            usage: ResourceUsage::default(),
            error: None,
            retry_count: 0,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            wall_time_ms: 1,
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn insert_find_update_round_trip() {
        let repo = InMemoryRepository::new();
        repo.insert_execution(&record("e-1", "acme")).await.unwrap();

        let found = repo.find_execution("acme", "e-1").await.unwrap().expect("found");
        assert_eq!(found.execution_id, "e-1");

        let mut updated = record("e-1", "acme");
        updated.retry_count = 2;
        assert!(repo.update_execution(&updated).await.unwrap());
        assert_eq!(repo.find_execution("acme", "e-1").await.unwrap().unwrap().retry_count, 2);

        assert!(!repo.update_execution(&record("missing", "acme")).await.unwrap());
    }

    #[tokio::test]
    async fn tenant_isolation_on_find() {
        let repo = InMemoryRepository::new();
        repo.insert_execution(&record("e-1", "acme")).await.unwrap();
        assert!(repo.find_execution("umbrella", "e-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audit_batch_is_idempotent_by_id() {
        let repo = InMemoryRepository::new();
        let entry = AuditEntry::new("acme", "e-1", "i-1", AuditEventType::ExecutionStarted);
        assert_eq!(repo.insert_audit_batch(&[entry.clone()]).await.unwrap(), 1);
        assert_eq!(repo.insert_audit_batch(&[entry]).await.unwrap(), 0);
        assert_eq!(repo.audit_len(), 1);
    }

    #[tokio::test]
    async fn soft_delete_hides_then_purge_finds_it() {
        let repo = InMemoryRepository::new();
        repo.insert_execution(&record("e-1", "acme")).await.unwrap();
        assert_eq!(repo.soft_delete("acme", "e-1").await.unwrap(), 1);
        assert!(repo.find_execution("acme", "e-1").await.unwrap().is_none());

        let cutoff = Utc::now() + ChronoDuration::seconds(1);
        assert_eq!(repo.find_soft_deleted_before(cutoff).await.unwrap(), vec!["e-1"]);
        assert_eq!(repo.hard_delete(&["e-1".to_string()]).await.unwrap(), 1);
        assert_eq!(repo.hard_delete(&["e-1".to_string()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn audit_trail_filters_by_tenant_and_execution() {
        let repo = InMemoryRepository::new();
        repo.insert_audit_batch(&[
            AuditEntry::new("acme", "e-1", "i-1", AuditEventType::ExecutionStarted),
            AuditEntry::new("acme", "e-2", "i-2", AuditEventType::ExecutionStarted),
            AuditEntry::new("umbrella", "e-3", "i-3", AuditEventType::ExecutionStarted),
        ])
        .await
        .unwrap();

        assert_eq!(repo.audit_trail("acme", None).await.unwrap().len(), 2);
        assert_eq!(repo.audit_trail("acme", Some("e-1")).await.unwrap().len(), 1);
        assert_eq!(repo.audit_trail("umbrella", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repository_backs_the_audit_sink() {
        let repo = Arc::new(InMemoryRepository::new());
        let sink = RepositoryAuditSink::new(repo.clone());
        let entry = AuditEntry::new("acme", "e-1", "i-1", AuditEventType::ExecutionStarted);
        sink.persist(&[entry.clone()]).await.unwrap();
        sink.persist(&[entry]).await.unwrap();
        assert_eq!(repo.audit_len(), 1);
    }
}
