//! In-process implementation of `StateStore` and `Catalog`
//!
//! All state lives behind one mutex, so every conditional operation is
//! trivially atomic. Nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::{
    Catalog, CleanupPage, Document, Repository, RepositoryStatus, SubDocument,
};
use crate::error::{DatabaseError, FlowError, Result};
use crate::models::{Checkpoint, Execution, ExecutionStatus, HistoryEntry, WorkflowKind};
use crate::storage::StateStore;

#[derive(Default)]
struct Inner {
    executions: HashMap<Uuid, Execution>,
    idempotency_keys: HashMap<String, Uuid>,
    history: HashMap<Uuid, Vec<HistoryEntry>>,
    repositories: HashMap<String, Repository>,
    /// Ordered by id, which is the cleanup cursor order
    documents: BTreeMap<Uuid, Document>,
    sub_documents: HashMap<Uuid, Vec<SubDocument>>,
}

/// Shared in-memory store; clones see the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of document records across all repositories
    pub fn document_total(&self) -> usize {
        self.inner.lock().documents.len()
    }
}

fn holds_lease(execution: &Execution, worker_id: &str) -> bool {
    execution.status == ExecutionStatus::Running
        && execution.locked_by.as_deref() == Some(worker_id)
}

fn is_due(execution: &Execution, now: DateTime<Utc>) -> bool {
    let timer_elapsed = execution.run_after.map(|t| t <= now).unwrap_or(true);
    let lease_expired = execution.locked_until.map(|t| t < now).unwrap_or(true);
    match execution.status {
        ExecutionStatus::Queued | ExecutionStatus::Waiting => timer_elapsed && lease_expired,
        ExecutionStatus::Running => lease_expired,
        _ => false,
    }
}

fn release(execution: &mut Execution) {
    execution.locked_by = None;
    execution.locked_until = None;
    execution.updated_at = Utc::now();
}

#[async_trait]
impl StateStore for MemoryStore {
    // =========================================================================
    // Execution Operations
    // =========================================================================

    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(key) = &execution.idempotency_key {
            if inner.idempotency_keys.contains_key(key) {
                return Err(DatabaseError::Constraint(format!(
                    "idempotency key already used: {}",
                    key
                ))
                .into());
            }
            inner.idempotency_keys.insert(key.clone(), execution.id);
        }
        inner.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.inner.lock().executions.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Uuid>> {
        Ok(self.inner.lock().idempotency_keys.get(key).copied())
    }

    async fn list_executions(
        &self,
        workflow: Option<WorkflowKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>> {
        let inner = self.inner.lock();
        let mut executions: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| workflow.map(|w| e.workflow == w).unwrap_or(true))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(executions
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn lease_executions(
        &self,
        worker_id: &str,
        limit: i64,
        lock_duration_secs: i64,
    ) -> Result<Vec<Execution>> {
        let now = Utc::now();
        let lock_until = now + chrono::Duration::seconds(lock_duration_secs);
        let mut inner = self.inner.lock();

        let mut due: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|e| is_due(e, now))
            .map(|e| e.id)
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut leased = Vec::with_capacity(due.len());
        for id in due {
            if let Some(execution) = inner.executions.get_mut(&id) {
                execution.status = ExecutionStatus::Running;
                execution.started_at.get_or_insert(now);
                execution.locked_by = Some(worker_id.to_string());
                execution.locked_until = Some(lock_until);
                execution.updated_at = now;
                leased.push(execution.clone());
            }
        }
        Ok(leased)
    }

    async fn lease_execution(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_duration_secs: i64,
    ) -> Result<Option<Execution>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        match inner.executions.get_mut(&id) {
            Some(execution) if is_due(execution, now) => {
                execution.status = ExecutionStatus::Running;
                execution.started_at.get_or_insert(now);
                execution.locked_by = Some(worker_id.to_string());
                execution.locked_until = Some(now + chrono::Duration::seconds(lock_duration_secs));
                execution.updated_at = now;
                Ok(Some(execution.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn checkpoint(
        &self,
        id: Uuid,
        worker_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.executions.get_mut(&id) {
            Some(execution) if holds_lease(execution, worker_id) => {
                execution.state_name = checkpoint.state_name.clone();
                execution.state = checkpoint.state.clone();
                execution.transitions = checkpoint.transitions;
                execution.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn suspend(
        &self,
        id: Uuid,
        worker_id: &str,
        checkpoint: &Checkpoint,
        run_after: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.executions.get_mut(&id) {
            Some(execution) if holds_lease(execution, worker_id) => {
                execution.state_name = checkpoint.state_name.clone();
                execution.state = checkpoint.state.clone();
                execution.transitions = checkpoint.transitions;
                execution.status = ExecutionStatus::Waiting;
                execution.run_after = Some(run_after);
                release(execution);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_execution(
        &self,
        id: Uuid,
        worker_id: &str,
        output: &serde_json::Value,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.executions.get_mut(&id) {
            Some(execution) if holds_lease(execution, worker_id) => {
                execution.status = ExecutionStatus::Succeeded;
                execution.output = Some(output.clone());
                execution.ended_at = Some(Utc::now());
                release(execution);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_execution(
        &self,
        id: Uuid,
        worker_id: &str,
        status: ExecutionStatus,
        error: &str,
        cause: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.executions.get_mut(&id) {
            Some(execution) if holds_lease(execution, worker_id) => {
                execution.status = status;
                execution.error = Some(error.to_string());
                execution.cause = Some(cause.to_string());
                execution.ended_at = Some(Utc::now());
                release(execution);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_duration_secs: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.executions.get_mut(&id) {
            Some(execution) if holds_lease(execution, worker_id) => {
                execution.locked_until =
                    Some(Utc::now() + chrono::Duration::seconds(lock_duration_secs));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(execution) = inner.executions.get_mut(&id) {
            if holds_lease(execution, worker_id) {
                execution.status = ExecutionStatus::Queued;
                release(execution);
            }
        }
        Ok(())
    }

    // =========================================================================
    // History
    // =========================================================================

    async fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        let entries = inner.history.entry(entry.execution_id).or_default();
        // a replayed transition keeps the first record
        if !entries.iter().any(|e| e.sequence == entry.sequence) {
            entries.push(entry.clone());
        }
        Ok(())
    }

    async fn get_history(&self, execution_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let inner = self.inner.lock();
        let mut entries = inner.history.get(&execution_id).cloned().unwrap_or_default();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup_old_executions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let expired: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|e| e.status.is_terminal() && e.ended_at.map(|t| t < older_than).unwrap_or(false))
            .map(|e| e.id)
            .collect();

        for id in &expired {
            if let Some(execution) = inner.executions.remove(id) {
                if let Some(key) = execution.idempotency_key {
                    inner.idempotency_keys.remove(&key);
                }
            }
            inner.history.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    // =========================================================================
    // Repositories
    // =========================================================================

    async fn put_repository(&self, repository: &Repository) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.repositories.get(&repository.id) {
            if existing.status != RepositoryStatus::CreateFailed {
                return Err(FlowError::RepositoryExists {
                    id: repository.id.clone(),
                    status: existing.status,
                });
            }
        }
        inner
            .repositories
            .insert(repository.id.clone(), repository.clone());
        Ok(())
    }

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        Ok(self.inner.lock().repositories.get(id).cloned())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let mut repositories: Vec<Repository> =
            self.inner.lock().repositories.values().cloned().collect();
        repositories.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(repositories)
    }

    async fn transition_repository(
        &self,
        id: &str,
        to: RepositoryStatus,
        stack_name: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Repository> {
        let mut inner = self.inner.lock();
        let repository = inner
            .repositories
            .get_mut(id)
            .ok_or_else(|| FlowError::RepositoryNotFound { id: id.to_string() })?;

        if !repository.status.can_transition_to(to) {
            return Err(FlowError::StatusConflict {
                id: id.to_string(),
                from: repository.status,
                to,
            });
        }

        repository.status = to;
        if let Some(stack) = stack_name {
            repository.stack_name = Some(stack.to_string());
        }
        repository.status_reason = reason.map(str::to_string);
        repository.updated_at = Utc::now();
        Ok(repository.clone())
    }

    async fn delete_repository(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().repositories.remove(id).is_some())
    }

    // =========================================================================
    // Documents
    // =========================================================================

    async fn upsert_document(&self, document: &Document) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut document = document.clone();
        if let Some(existing) = inner.documents.get(&document.id) {
            document.created_at = existing.created_at;
        }
        inner.documents.insert(document.id, document);
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.inner.lock().documents.get(&id).cloned())
    }

    async fn find_documents_by_source(
        &self,
        repository_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<Document>> {
        Ok(self
            .inner
            .lock()
            .documents
            .values()
            .filter(|d| {
                d.repository_id == repository_id && d.source.bucket == bucket && d.source.key == key
            })
            .cloned()
            .collect())
    }

    async fn count_documents(&self, repository_id: &str) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .documents
            .values()
            .filter(|d| d.repository_id == repository_id)
            .count() as u64)
    }

    async fn replace_sub_documents(
        &self,
        document_id: Uuid,
        chunks: &[SubDocument],
    ) -> Result<()> {
        self.inner
            .lock()
            .sub_documents
            .insert(document_id, chunks.to_vec());
        Ok(())
    }

    async fn list_sub_documents(&self, document_id: Uuid) -> Result<Vec<SubDocument>> {
        let inner = self.inner.lock();
        let mut chunks = inner
            .sub_documents
            .get(&document_id)
            .cloned()
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.ordinal);
        Ok(chunks)
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.sub_documents.remove(&id);
        Ok(inner.documents.remove(&id).is_some())
    }

    async fn cleanup_documents(
        &self,
        repository_id: &str,
        last_evaluated: Option<&str>,
        page_size: usize,
    ) -> Result<CleanupPage> {
        let page_size = page_size.max(1);
        let after = match last_evaluated {
            Some(cursor) => Some(
                Uuid::parse_str(cursor)
                    .map_err(|e| FlowError::InvalidInput(format!("bad cursor: {}", e)))?,
            ),
            None => None,
        };

        let mut inner = self.inner.lock();
        let candidates: Vec<Uuid> = inner
            .documents
            .values()
            .filter(|d| d.repository_id == repository_id)
            .filter(|d| after.map(|a| d.id > a).unwrap_or(true))
            .map(|d| d.id)
            .take(page_size + 1)
            .collect();

        let more = candidates.len() > page_size;
        let page = &candidates[..candidates.len().min(page_size)];
        for id in page {
            inner.documents.remove(id);
            inner.sub_documents.remove(id);
        }

        Ok(CleanupPage {
            removed: page.len(),
            last_evaluated: if more {
                page.last().map(|id| id.to_string())
            } else {
                None
            },
        })
    }
}
