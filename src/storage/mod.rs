//! Durable state for the engine and the catalog
//!
//! Implement `StateStore` and `Catalog` for any database backend.
//! kbflow ships with an in-process store and a SQLite store.

mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Checkpoint, Execution, ExecutionStatus, HistoryEntry, WorkflowKind};

/// Engine storage trait - executions, leases, checkpoints and history
///
/// Every mutation of a leased execution is conditional on the caller still
/// holding the lease, so a worker whose lease expired can never overwrite
/// progress made by the worker that re-leased it.
///
/// # Example
///
/// ```ignore
/// use kbflow::storage::{MemoryStore, StateStore};
///
/// // In-process, for tests and embedded use
/// let store = MemoryStore::new();
///
/// // Or SQLite for durability across restarts
/// let store = SqliteStore::connect("sqlite://kbflow.db?mode=rwc").await?;
/// store.migrate().await?;
/// ```
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // =========================================================================
    // Execution Operations
    // =========================================================================

    /// Insert a new execution
    ///
    /// Fails with a constraint error when the idempotency key is taken.
    async fn insert_execution(&self, execution: &Execution) -> Result<()>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>>;

    /// Execution id registered under an idempotency key
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Uuid>>;

    /// Most recent first, optionally filtered by workflow
    async fn list_executions(
        &self,
        workflow: Option<WorkflowKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>>;

    /// Lease due executions (atomic operation)
    ///
    /// Due means queued, waiting with `run_after <= now`, or running with an
    /// expired lease (a crashed worker). Leased executions become running.
    async fn lease_executions(
        &self,
        worker_id: &str,
        limit: i64,
        lock_duration_secs: i64,
    ) -> Result<Vec<Execution>>;

    /// Lease one execution by id if it is due
    async fn lease_execution(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_duration_secs: i64,
    ) -> Result<Option<Execution>>;

    /// Persist a transition; false when the lease was lost
    async fn checkpoint(&self, id: Uuid, worker_id: &str, checkpoint: &Checkpoint)
        -> Result<bool>;

    /// Persist a transition into a timer wait and release the lease
    async fn suspend(
        &self,
        id: Uuid,
        worker_id: &str,
        checkpoint: &Checkpoint,
        run_after: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark succeeded with output and release the lease
    async fn complete_execution(
        &self,
        id: Uuid,
        worker_id: &str,
        output: &serde_json::Value,
    ) -> Result<bool>;

    /// Mark failed or timed out and release the lease
    async fn fail_execution(
        &self,
        id: Uuid,
        worker_id: &str,
        status: ExecutionStatus,
        error: &str,
        cause: &str,
    ) -> Result<bool>;

    /// Extend the lease (heartbeat); false when no longer held
    async fn extend_lease(&self, id: Uuid, worker_id: &str, lock_duration_secs: i64)
        -> Result<bool>;

    /// Return a running execution to the queue (worker shutdown)
    async fn release_lease(&self, id: Uuid, worker_id: &str) -> Result<()>;

    // =========================================================================
    // History
    // =========================================================================

    async fn append_history(&self, entry: &HistoryEntry) -> Result<()>;

    /// Ordered by sequence
    async fn get_history(&self, execution_id: Uuid) -> Result<Vec<HistoryEntry>>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Health check - verify database connectivity
    async fn ping(&self) -> Result<()>;

    /// Run database migrations
    async fn migrate(&self) -> Result<()>;

    /// Remove terminal executions (and their history) that ended before `older_than`
    async fn cleanup_old_executions(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Extension trait for StateStore with convenience methods
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Insert unless the idempotency key is already registered.
    ///
    /// Returns the id of the execution that owns the key, and whether it was
    /// created by this call.
    async fn insert_idempotent(&self, execution: &Execution) -> Result<(Uuid, bool)> {
        if let Some(key) = &execution.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                return Ok((existing, false));
            }
        }

        match self.insert_execution(execution).await {
            Ok(()) => Ok((execution.id, true)),
            Err(e) => {
                // lost a race on the same key
                if let Some(key) = &execution.idempotency_key {
                    if let Some(existing) = self.find_by_idempotency_key(key).await? {
                        return Ok((existing, false));
                    }
                }
                Err(e)
            }
        }
    }

    /// Executions that have not reached a terminal status
    async fn list_active(&self, workflow: Option<WorkflowKind>, limit: i64) -> Result<Vec<Execution>> {
        let executions = self.list_executions(workflow, limit, 0).await?;
        Ok(executions
            .into_iter()
            .filter(|e| !e.status.is_terminal())
            .collect())
    }
}

// Blanket implementation
impl<T: StateStore> StateStoreExt for T {}
