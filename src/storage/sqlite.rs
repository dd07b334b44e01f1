//! SQLite implementation of `StateStore` and `Catalog`
//!
//! Ideal for:
//! - Single-node deployments
//! - Local development
//! - Restart and resume testing

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::catalog::{
    Catalog, CleanupPage, Document, DocumentStatus, ObjectRef, Repository, RepositoryKind,
    RepositoryStatus, SubDocument,
};
use crate::error::{DatabaseError, FlowError, Result};
use crate::models::{Checkpoint, Execution, ExecutionStatus, HistoryEntry, WorkflowKind};
use crate::storage::StateStore;

const EXECUTION_COLUMNS: &str = r#"
    id, workflow, status, state_name, state, input, settings, output, error, cause,
    transitions, idempotency_key, created_at, updated_at, started_at, ended_at,
    deadline, run_after, locked_by, locked_until
"#;

const DOCUMENT_COLUMNS: &str = r#"
    id, repository_id, collection, partition_key, source_bucket, source_key,
    source_modified, status, chunk_count, error, created_at, updated_at
"#;

/// SQLite-backed store
///
/// Uses SQLite-specific features:
/// - WAL mode for better concurrency
/// - `ON CONFLICT ... DO UPDATE ... WHERE` for conditional inserts
///
/// Timestamps are stored as fixed-width RFC 3339 strings so they compare
/// correctly as text.
///
/// # Example
///
/// ```ignore
/// // File-based for persistence
/// let store = SqliteStore::connect("sqlite://kbflow.db?mode=rwc").await?;
///
/// // In-memory for testing
/// let store = SqliteStore::in_memory().await?;
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to SQLite database
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite works best with single writer
            .connect(url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Create in-memory store with the schema applied
    pub async fn in_memory() -> Result<Self> {
        let store = Self::connect("sqlite::memory:").await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, flushing the WAL
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    // =========================================================================
    // Execution Operations
    // =========================================================================

    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, workflow, status, state_name, state, input, settings, output, error, cause,
                transitions, idempotency_key, created_at, updated_at, started_at, ended_at,
                deadline, run_after, locked_by, locked_until
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow.as_str())
        .bind(execution.status.as_str())
        .bind(&execution.state_name)
        .bind(serde_json::to_string(&execution.state)?)
        .bind(serde_json::to_string(&execution.input)?)
        .bind(serde_json::to_string(&execution.settings)?)
        .bind(execution.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&execution.error)
        .bind(&execution.cause)
        .bind(execution.transitions)
        .bind(&execution.idempotency_key)
        .bind(ts(&execution.created_at))
        .bind(ts(&execution.updated_at))
        .bind(execution.started_at.as_ref().map(ts))
        .bind(execution.ended_at.as_ref().map(ts))
        .bind(execution.deadline.as_ref().map(ts))
        .bind(execution.run_after.as_ref().map(ts))
        .bind(&execution.locked_by)
        .bind(execution.locked_until.as_ref().map(ts))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM executions WHERE id = ?",
            EXECUTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Uuid>> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT id FROM executions WHERE idempotency_key = ? LIMIT 1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|s| parse_uuid(&s)).transpose()
    }

    async fn list_executions(
        &self,
        workflow: Option<WorkflowKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM executions
            WHERE (? IS NULL OR workflow = ?)
            ORDER BY id DESC
            LIMIT ? OFFSET ?
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(workflow.map(|w| w.as_str()))
        .bind(workflow.map(|w| w.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn lease_execution(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_duration_secs: i64,
    ) -> Result<Option<Execution>> {
        let now = Utc::now();
        let now_str = ts(&now);
        let lock_until = ts(&(now + chrono::Duration::seconds(lock_duration_secs)));

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'running',
                started_at = COALESCE(started_at, ?),
                updated_at = ?,
                locked_until = ?,
                locked_by = ?
            WHERE id = ? AND ((
                status IN ('queued', 'waiting')
                AND (run_after IS NULL OR run_after <= ?)
                AND (locked_until IS NULL OR locked_until < ?)
            ) OR (
                status = 'running' AND (locked_until IS NULL OR locked_until < ?)
            ))
            "#,
        )
        .bind(&now_str)
        .bind(&now_str)
        .bind(&lock_until)
        .bind(worker_id)
        .bind(id.to_string())
        .bind(&now_str)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_execution(id).await
    }

    async fn lease_executions(
        &self,
        worker_id: &str,
        limit: i64,
        lock_duration_secs: i64,
    ) -> Result<Vec<Execution>> {
        let now = Utc::now();
        let now_str = ts(&now);
        let lock_until = ts(&(now + chrono::Duration::seconds(lock_duration_secs)));

        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM executions
            WHERE (
                status IN ('queued', 'waiting')
                AND (run_after IS NULL OR run_after <= ?)
                AND (locked_until IS NULL OR locked_until < ?)
            ) OR (
                status = 'running' AND (locked_until IS NULL OR locked_until < ?)
            )
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(&now_str)
        .bind(&now_str)
        .bind(&now_str)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(vec![]);
        }

        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            r#"
            UPDATE executions
            SET status = 'running',
                started_at = COALESCE(started_at, ?),
                updated_at = ?,
                locked_until = ?,
                locked_by = ?
            WHERE id IN ({})
            "#,
            placeholders
        );

        let mut q = sqlx::query(&query)
            .bind(&now_str)
            .bind(&now_str)
            .bind(&lock_until)
            .bind(worker_id);
        for id in &ids {
            q = q.bind(id);
        }
        q.execute(&mut *tx).await?;

        let select = format!(
            "SELECT {} FROM executions WHERE id IN ({}) ORDER BY id",
            EXECUTION_COLUMNS, placeholders
        );
        let mut q = sqlx::query(&select);
        for id in &ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&mut *tx).await?;

        tx.commit().await?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn checkpoint(
        &self,
        id: Uuid,
        worker_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET state_name = ?, state = ?, transitions = ?, updated_at = ?
            WHERE id = ? AND status = 'running' AND locked_by = ?
            "#,
        )
        .bind(&checkpoint.state_name)
        .bind(serde_json::to_string(&checkpoint.state)?)
        .bind(checkpoint.transitions)
        .bind(ts(&Utc::now()))
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn suspend(
        &self,
        id: Uuid,
        worker_id: &str,
        checkpoint: &Checkpoint,
        run_after: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET state_name = ?, state = ?, transitions = ?, updated_at = ?,
                status = 'waiting', run_after = ?,
                locked_by = NULL, locked_until = NULL
            WHERE id = ? AND status = 'running' AND locked_by = ?
            "#,
        )
        .bind(&checkpoint.state_name)
        .bind(serde_json::to_string(&checkpoint.state)?)
        .bind(checkpoint.transitions)
        .bind(ts(&Utc::now()))
        .bind(ts(&run_after))
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_execution(
        &self,
        id: Uuid,
        worker_id: &str,
        output: &serde_json::Value,
    ) -> Result<bool> {
        let now = ts(&Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'succeeded', output = ?, ended_at = ?, updated_at = ?,
                locked_by = NULL, locked_until = NULL
            WHERE id = ? AND status = 'running' AND locked_by = ?
            "#,
        )
        .bind(serde_json::to_string(output)?)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_execution(
        &self,
        id: Uuid,
        worker_id: &str,
        status: ExecutionStatus,
        error: &str,
        cause: &str,
    ) -> Result<bool> {
        let now = ts(&Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, error = ?, cause = ?, ended_at = ?, updated_at = ?,
                locked_by = NULL, locked_until = NULL
            WHERE id = ? AND status = 'running' AND locked_by = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(cause)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn extend_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_duration_secs: i64,
    ) -> Result<bool> {
        let lock_until = Utc::now() + chrono::Duration::seconds(lock_duration_secs);
        let result = sqlx::query(
            r#"
            UPDATE executions SET locked_until = ?
            WHERE id = ? AND status = 'running' AND locked_by = ?
            "#,
        )
        .bind(ts(&lock_until))
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, id: Uuid, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = 'queued', updated_at = ?, locked_by = NULL, locked_until = NULL
            WHERE id = ? AND status = 'running' AND locked_by = ?
            "#,
        )
        .bind(ts(&Utc::now()))
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // History
    // =========================================================================

    async fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_history (
                execution_id, sequence, from_state, to_state, task, detail, recorded_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (execution_id, sequence) DO NOTHING
            "#,
        )
        .bind(entry.execution_id.to_string())
        .bind(entry.sequence)
        .bind(&entry.from_state)
        .bind(&entry.to_state)
        .bind(&entry.task)
        .bind(entry.detail.as_ref().map(serde_json::to_string).transpose()?)
        .bind(ts(&entry.recorded_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_history(&self, execution_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, sequence, from_state, to_state, task, detail, recorded_at
            FROM execution_history WHERE execution_id = ?
            ORDER BY sequence
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_history).collect()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| FlowError::Database(DatabaseError::Migration(e.to_string())))?;
        Ok(())
    }

    async fn cleanup_old_executions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let older_than = ts(&older_than);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM execution_history WHERE execution_id IN (
                SELECT id FROM executions
                WHERE status IN ('succeeded', 'failed', 'timed_out')
                  AND ended_at < ?
            )
            "#,
        )
        .bind(&older_than)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM executions
            WHERE status IN ('succeeded', 'failed', 'timed_out')
              AND ended_at < ?
            "#,
        )
        .bind(&older_than)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Catalog for SqliteStore {
    // =========================================================================
    // Repositories
    // =========================================================================

    async fn put_repository(&self, repository: &Repository) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO repositories (
                id, kind, status, config, stack_name, status_reason, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                kind = excluded.kind,
                status = excluded.status,
                config = excluded.config,
                stack_name = excluded.stack_name,
                status_reason = excluded.status_reason,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            WHERE repositories.status = 'CREATE_FAILED'
            "#,
        )
        .bind(&repository.id)
        .bind(repository.kind.as_str())
        .bind(repository.status.as_str())
        .bind(serde_json::to_string(&repository.config)?)
        .bind(&repository.stack_name)
        .bind(&repository.status_reason)
        .bind(ts(&repository.created_at))
        .bind(ts(&repository.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let status = self
                .get_repository(&repository.id)
                .await?
                .map(|r| r.status)
                .unwrap_or(RepositoryStatus::CreateInProgress);
            return Err(FlowError::RepositoryExists {
                id: repository.id.clone(),
                status,
            });
        }
        Ok(())
    }

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, status, config, stack_name, status_reason, created_at, updated_at
            FROM repositories WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_repository).transpose()
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, status, config, stack_name, status_reason, created_at, updated_at
            FROM repositories ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_repository).collect()
    }

    async fn transition_repository(
        &self,
        id: &str,
        to: RepositoryStatus,
        stack_name: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Repository> {
        let allowed = to.allowed_predecessors();

        if !allowed.is_empty() {
            let placeholders = allowed.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let query = format!(
                r#"
                UPDATE repositories
                SET status = ?, stack_name = COALESCE(?, stack_name),
                    status_reason = ?, updated_at = ?
                WHERE id = ? AND status IN ({})
                "#,
                placeholders
            );

            let mut q = sqlx::query(&query)
                .bind(to.as_str())
                .bind(stack_name)
                .bind(reason)
                .bind(ts(&Utc::now()))
                .bind(id);
            for status in allowed {
                q = q.bind(status.as_str());
            }

            if q.execute(&self.pool).await?.rows_affected() == 1 {
                return self
                    .get_repository(id)
                    .await?
                    .ok_or_else(|| FlowError::RepositoryNotFound { id: id.to_string() });
            }
        }

        match self.get_repository(id).await? {
            None => Err(FlowError::RepositoryNotFound { id: id.to_string() }),
            Some(current) => Err(FlowError::StatusConflict {
                id: id.to_string(),
                from: current.status,
                to,
            }),
        }
    }

    async fn delete_repository(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM repositories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Documents
    // =========================================================================

    async fn upsert_document(&self, document: &Document) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO documents ({})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                collection = excluded.collection,
                partition_key = excluded.partition_key,
                source_bucket = excluded.source_bucket,
                source_key = excluded.source_key,
                source_modified = excluded.source_modified,
                status = excluded.status,
                chunk_count = excluded.chunk_count,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(document.id.to_string())
        .bind(&document.repository_id)
        .bind(&document.collection)
        .bind(&document.partition_key)
        .bind(&document.source.bucket)
        .bind(&document.source.key)
        .bind(document.source.last_modified.as_ref().map(ts))
        .bind(document.status.as_str())
        .bind(document.chunk_count as i64)
        .bind(&document.error)
        .bind(ts(&document.created_at))
        .bind(ts(&document.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_documents_by_source(
        &self,
        repository_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM documents
            WHERE repository_id = ? AND source_bucket = ? AND source_key = ?
            ORDER BY id
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(repository_id)
        .bind(bucket)
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn count_documents(&self, repository_id: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE repository_id = ?")
                .bind(repository_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn replace_sub_documents(
        &self,
        document_id: Uuid,
        chunks: &[SubDocument],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sub_documents WHERE document_id = ?")
            .bind(document_id.to_string())
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO sub_documents (id, document_id, repository_id, ordinal, chunk_ref)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(chunk.document_id.to_string())
            .bind(&chunk.repository_id)
            .bind(chunk.ordinal as i64)
            .bind(&chunk.chunk_ref)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_sub_documents(&self, document_id: Uuid) -> Result<Vec<SubDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, repository_id, ordinal, chunk_ref
            FROM sub_documents WHERE document_id = ?
            ORDER BY ordinal
            "#,
        )
        .bind(document_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_sub_document).collect()
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sub_documents WHERE document_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_documents(
        &self,
        repository_id: &str,
        last_evaluated: Option<&str>,
        page_size: usize,
    ) -> Result<CleanupPage> {
        let page_size = page_size.max(1);
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM documents
            WHERE repository_id = ? AND (? IS NULL OR id > ?)
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(repository_id)
        .bind(last_evaluated)
        .bind(last_evaluated)
        .bind((page_size + 1) as i64)
        .fetch_all(&mut *tx)
        .await?;

        let more = candidates.len() > page_size;
        let page = &candidates[..candidates.len().min(page_size)];

        if !page.is_empty() {
            let placeholders = page.iter().map(|_| "?").collect::<Vec<_>>().join(",");

            let delete_chunks = format!(
                "DELETE FROM sub_documents WHERE document_id IN ({})",
                placeholders
            );
            let mut q = sqlx::query(&delete_chunks);
            for id in page {
                q = q.bind(id);
            }
            q.execute(&mut *tx).await?;

            let delete_docs = format!("DELETE FROM documents WHERE id IN ({})", placeholders);
            let mut q = sqlx::query(&delete_docs);
            for id in page {
                q = q.bind(id);
            }
            q.execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(CleanupPage {
            removed: page.len(),
            last_evaluated: if more { page.last().cloned() } else { None },
        })
    }
}

// Helper functions
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt(format!("timestamp {:?}: {}", s, e)).into())
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Corrupt(format!("uuid {:?}: {}", s, e)).into())
}

fn corrupt(what: &str, value: &str) -> FlowError {
    DatabaseError::Corrupt(format!("{} {:?}", what, value)).into()
}

fn row_to_execution(row: &SqliteRow) -> Result<Execution> {
    let id: String = row.get("id");
    let workflow: String = row.get("workflow");
    let status: String = row.get("status");
    let state: String = row.get("state");
    let input: String = row.get("input");
    let settings: String = row.get("settings");
    let output: Option<String> = row.get("output");

    Ok(Execution {
        id: parse_uuid(&id)?,
        workflow: WorkflowKind::parse(&workflow).ok_or_else(|| corrupt("workflow", &workflow))?,
        status: ExecutionStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        state_name: row.get("state_name"),
        state: serde_json::from_str(&state)?,
        input: serde_json::from_str(&input)?,
        settings: serde_json::from_str(&settings)?,
        output: output.map(|s| serde_json::from_str(&s)).transpose()?,
        error: row.get("error"),
        cause: row.get("cause"),
        transitions: row.get("transitions"),
        idempotency_key: row.get("idempotency_key"),
        created_at: parse_datetime(row.get("created_at"))?,
        updated_at: parse_datetime(row.get("updated_at"))?,
        started_at: parse_optional_datetime(row.get("started_at"))?,
        ended_at: parse_optional_datetime(row.get("ended_at"))?,
        deadline: parse_optional_datetime(row.get("deadline"))?,
        run_after: parse_optional_datetime(row.get("run_after"))?,
        locked_by: row.get("locked_by"),
        locked_until: parse_optional_datetime(row.get("locked_until"))?,
    })
}

fn row_to_history(row: &SqliteRow) -> Result<HistoryEntry> {
    let execution_id: String = row.get("execution_id");
    let detail: Option<String> = row.get("detail");

    Ok(HistoryEntry {
        execution_id: parse_uuid(&execution_id)?,
        sequence: row.get("sequence"),
        from_state: row.get("from_state"),
        to_state: row.get("to_state"),
        task: row.get("task"),
        detail: detail.map(|s| serde_json::from_str(&s)).transpose()?,
        recorded_at: parse_datetime(row.get("recorded_at"))?,
    })
}

fn row_to_repository(row: &SqliteRow) -> Result<Repository> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let config: String = row.get("config");

    Ok(Repository {
        id: row.get("id"),
        kind: RepositoryKind::parse(&kind).ok_or_else(|| corrupt("repository kind", &kind))?,
        status: RepositoryStatus::parse(&status)
            .ok_or_else(|| corrupt("repository status", &status))?,
        config: serde_json::from_str(&config)?,
        stack_name: row.get("stack_name"),
        status_reason: row.get("status_reason"),
        created_at: parse_datetime(row.get("created_at"))?,
        updated_at: parse_datetime(row.get("updated_at"))?,
    })
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let chunk_count: i64 = row.get("chunk_count");

    Ok(Document {
        id: parse_uuid(&id)?,
        repository_id: row.get("repository_id"),
        collection: row.get("collection"),
        partition_key: row.get("partition_key"),
        source: ObjectRef {
            bucket: row.get("source_bucket"),
            key: row.get("source_key"),
            last_modified: parse_optional_datetime(row.get("source_modified"))?,
        },
        status: DocumentStatus::parse(&status)
            .ok_or_else(|| corrupt("document status", &status))?,
        chunk_count: chunk_count as u32,
        error: row.get("error"),
        created_at: parse_datetime(row.get("created_at"))?,
        updated_at: parse_datetime(row.get("updated_at"))?,
    })
}

fn row_to_sub_document(row: &SqliteRow) -> Result<SubDocument> {
    let document_id: String = row.get("document_id");
    let ordinal: i64 = row.get("ordinal");

    Ok(SubDocument {
        id: row.get("id"),
        document_id: parse_uuid(&document_id)?,
        repository_id: row.get("repository_id"),
        ordinal: ordinal as u32,
        chunk_ref: row.get("chunk_ref"),
    })
}
