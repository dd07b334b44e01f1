//! Tasks - the units of work invoked by workflow states
//!
//! A `Task` names one side-effecting operation against the catalog or an
//! external collaborator. Every task is safe to repeat: workflow instances
//! are at-least-once, so a state may run its task again after a restart.

mod http;
pub mod ingest;
pub mod retry;

pub use http::HttpTasks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::catalog::{
    Catalog, CleanupPage, Document, DocumentStatus, ObjectRef, PipelineConfig, Repository,
    RepositoryStatus,
};
use crate::concurrency::{ConcurrencyError, ConcurrencyManager};
use crate::config::WorkflowSettings;
use crate::error::{DatabaseError, FlowError};
use crate::metrics::FlowMetrics;

/// Outcome taxonomy of a task attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The request itself was rejected; retrying cannot help
    #[error("invocation rejected: {0}")]
    Invocation(String),

    /// Service or network failure worth retrying
    #[error("service unavailable: {0}")]
    Transient(String),

    /// The attempt exceeded its time budget
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Domain failure with a named error
    #[error("{error}: {cause}")]
    Failed { error: String, cause: String },
}

impl TaskError {
    pub fn failed(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            cause: cause.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Error name recorded on the execution
    pub fn name(&self) -> &str {
        match self {
            Self::Invocation(_) => "Task.InvocationError",
            Self::Transient(_) => "Task.ServiceError",
            Self::Timeout(_) => "Task.Timeout",
            Self::Failed { error, .. } => error,
        }
    }

    pub fn cause(&self) -> String {
        match self {
            Self::Failed { cause, .. } => cause.clone(),
            other => other.to_string(),
        }
    }
}

impl From<FlowError> for TaskError {
    fn from(err: FlowError) -> Self {
        if err.is_conditional_failure() {
            return Self::failed("Catalog.ConditionalCheckFailed", err.to_string());
        }
        match err {
            FlowError::RepositoryNotFound { .. } => {
                Self::failed("Catalog.RepositoryNotFound", err.to_string())
            }
            FlowError::Database(
                DatabaseError::Constraint(_)
                | DatabaseError::Corrupt(_)
                | DatabaseError::Migration(_)
                | DatabaseError::NotFound,
            ) => Self::failed("Catalog.Error", err.to_string()),
            FlowError::Database(_) | FlowError::Timeout => Self::Transient(err.to_string()),
            other => Self::failed("Catalog.Error", other.to_string()),
        }
    }
}

impl From<ConcurrencyError> for TaskError {
    fn from(err: ConcurrencyError) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Serializable failure carried through workflow state and onto the execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub error: String,
    pub cause: String,
    #[serde(default)]
    pub attempts: u32,
}

impl TaskFailure {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
            attempts: 0,
        }
    }

    pub fn from_error(err: &TaskError, attempts: u32) -> Self {
        Self {
            error: err.name().to_string(),
            cause: err.cause(),
            attempts,
        }
    }

    /// Execution or loop budget exceeded
    pub fn states_timeout(cause: impl Into<String>) -> Self {
        Self::new("States.Timeout", cause)
    }

    pub fn is_conditional_failure(&self) -> bool {
        self.error == "Catalog.ConditionalCheckFailed"
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.cause)
    }
}

/// Status reported by the infrastructure provisioner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfraStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
    UpdateInProgress,
    UpdateComplete,
    UpdateRollbackComplete,
    DeleteInProgress,
    DeleteComplete,
    DeleteFailed,
    /// The provisioner has no record of the stack
    NotFound,
}

impl InfraStatus {
    pub fn is_creating(&self) -> bool {
        matches!(self, Self::CreateInProgress | Self::UpdateInProgress)
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::CreateComplete | Self::UpdateComplete)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::DeleteComplete | Self::NotFound)
    }

    pub fn is_delete_failed(&self) -> bool {
        matches!(self, Self::DeleteFailed)
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// Creates and destroys the physical backing store of a repository
#[async_trait]
pub trait InfraProvisioner: Send + Sync + 'static {
    /// Request creation; returns the stack to poll, or `None` when nothing
    /// separate is provisioned
    async fn request_create(&self, repository: &Repository) -> Result<Option<String>, TaskError>;

    async fn describe(&self, stack_name: &str) -> Result<InfraStatus, TaskError>;

    async fn request_delete(&self, stack_name: &str) -> Result<(), TaskError>;
}

#[async_trait]
pub trait CollectionManager: Send + Sync + 'static {
    async fn create_default_collection(&self, repository: &Repository) -> Result<(), TaskError>;

    /// Whether every collection of the repository is gone
    async fn collections_deleted(&self, repository_id: &str) -> Result<bool, TaskError>;
}

/// One indexing round for a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRequest {
    pub repository_id: String,
    pub collection: String,
    pub document_id: Uuid,
    pub source: ObjectRef,
    pub pipeline: PipelineConfig,
    /// Resume point returned by the previous round
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedDocument {
    /// Index-side chunk references produced by this round
    #[serde(default)]
    pub chunks: Vec<String>,
    /// Present when more work remains
    #[serde(default)]
    pub continuation: Option<String>,
}

/// Embeds and indexes documents; opaque beyond success or failure
#[async_trait]
pub trait DocumentIndexer: Send + Sync + 'static {
    async fn index(&self, request: &IndexRequest) -> Result<IndexedDocument, TaskError>;

    async fn remove(&self, document: &Document) -> Result<(), TaskError>;
}

#[async_trait]
pub trait ObjectSource: Send + Sync + 'static {
    async fn list_modified(
        &self,
        bucket: &str,
        prefix: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ObjectRef>, TaskError>;
}

/// The external collaborators of the workflows
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn InfraProvisioner>,
    pub collections: Arc<dyn CollectionManager>,
    pub indexer: Arc<dyn DocumentIndexer>,
    pub objects: Arc<dyn ObjectSource>,
}

impl Collaborators {
    /// All four roles served by one remote endpoint
    pub fn remote(tasks: Arc<HttpTasks>) -> Self {
        Self {
            provisioner: tasks.clone(),
            collections: tasks.clone(),
            indexer: tasks.clone(),
            objects: tasks,
        }
    }
}

// =============================================================================
// Task definitions
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    PutRepository {
        repository: Repository,
    },
    SetRepositoryStatus {
        repository_id: String,
        status: RepositoryStatus,
        stack_name: Option<String>,
        reason: Option<String>,
    },
    GetRepository {
        repository_id: String,
    },
    DeleteRepository {
        repository_id: String,
    },
    RequestProvisioning {
        repository: Repository,
    },
    DescribeInfrastructure {
        stack_name: String,
    },
    RequestInfraDeletion {
        stack_name: String,
    },
    CreateDefaultCollection {
        repository: Repository,
    },
    CheckCollectionDeletions {
        repository_id: String,
    },
    CleanupDocuments {
        repository_id: String,
        last_evaluated: Option<String>,
        page_size: usize,
    },
    ListModifiedObjects {
        bucket: String,
        prefix: String,
        since: DateTime<Utc>,
    },
    ProcessFiles {
        repository_id: String,
        pipeline: PipelineConfig,
        files: Vec<ObjectRef>,
    },
    DeleteDocuments {
        repository_id: String,
        object: ObjectRef,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PutRepository { .. } => "PutRepository",
            Self::SetRepositoryStatus { .. } => "SetRepositoryStatus",
            Self::GetRepository { .. } => "GetRepository",
            Self::DeleteRepository { .. } => "DeleteRepository",
            Self::RequestProvisioning { .. } => "RequestProvisioning",
            Self::DescribeInfrastructure { .. } => "DescribeInfrastructure",
            Self::RequestInfraDeletion { .. } => "RequestInfraDeletion",
            Self::CreateDefaultCollection { .. } => "CreateDefaultCollection",
            Self::CheckCollectionDeletions { .. } => "CheckCollectionDeletions",
            Self::CleanupDocuments { .. } => "CleanupDocuments",
            Self::ListModifiedObjects { .. } => "ListModifiedObjects",
            Self::ProcessFiles { .. } => "ProcessFiles",
            Self::DeleteDocuments { .. } => "DeleteDocuments",
        }
    }

    /// Budget for one attempt; fan-out tasks are bounded by the execution
    /// deadline and per-item timeouts instead
    pub fn timeout(&self, settings: &WorkflowSettings) -> Option<Duration> {
        match self {
            Self::ProcessFiles { .. } => None,
            _ => Some(settings.task_timeout()),
        }
    }

    /// Whether the engine may retry the task as a whole
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ProcessFiles { .. })
    }
}

/// Successful task result
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Done,
    Repository(Option<Repository>),
    Provisioning { stack_name: Option<String> },
    Infrastructure(InfraStatus),
    CollectionsDeleted(bool),
    Cleanup(CleanupPage),
    Objects(Vec<ObjectRef>),
    Processed(Vec<FileOutcome>),
    Removed { documents: usize },
}

impl TaskOutput {
    /// Compact form for execution history
    pub fn summary(&self) -> serde_json::Value {
        match self {
            Self::Done => serde_json::json!("done"),
            Self::Repository(repo) => serde_json::json!({
                "status": repo.as_ref().map(|r| r.status.as_str()),
            }),
            Self::Provisioning { stack_name } => serde_json::json!({ "stackName": stack_name }),
            Self::Infrastructure(status) => serde_json::json!({ "infraStatus": status }),
            Self::CollectionsDeleted(done) => serde_json::json!({ "collectionsDeleted": done }),
            Self::Cleanup(page) => serde_json::json!({
                "removed": page.removed,
                "lastEvaluated": page.last_evaluated,
            }),
            Self::Objects(objects) => serde_json::json!({ "objects": objects.len() }),
            Self::Processed(files) => serde_json::json!({ "files": files.len() }),
            Self::Removed { documents } => serde_json::json!({ "documents": documents }),
        }
    }
}

/// Result of ingesting one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub document_id: Uuid,
    pub bucket: String,
    pub key: String,
    pub status: DocumentStatus,
    pub chunks: u32,
}

/// Per-invocation context
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: Uuid,
    pub settings: WorkflowSettings,
}

/// Everything a task needs to run
#[derive(Clone)]
pub struct Services {
    pub catalog: Arc<dyn Catalog>,
    pub collaborators: Collaborators,
    pub concurrency: Arc<ConcurrencyManager>,
    pub metrics: Arc<FlowMetrics>,
}

impl Services {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        collaborators: Collaborators,
        concurrency: Arc<ConcurrencyManager>,
        metrics: Arc<FlowMetrics>,
    ) -> Self {
        Self {
            catalog,
            collaborators,
            concurrency,
            metrics,
        }
    }

    /// Run one attempt of a task
    pub async fn perform(&self, task: &Task, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        debug!(task = task.name(), execution_id = %ctx.execution_id, "Performing task");

        match task {
            Task::PutRepository { repository } => self.put_repository(repository).await,
            Task::SetRepositoryStatus {
                repository_id,
                status,
                stack_name,
                reason,
            } => {
                let repository = self
                    .catalog
                    .transition_repository(
                        repository_id,
                        *status,
                        stack_name.as_deref(),
                        reason.as_deref(),
                    )
                    .await?;
                Ok(TaskOutput::Repository(Some(repository)))
            }
            Task::GetRepository { repository_id } => Ok(TaskOutput::Repository(
                self.catalog.get_repository(repository_id).await?,
            )),
            Task::DeleteRepository { repository_id } => {
                self.catalog.delete_repository(repository_id).await?;
                Ok(TaskOutput::Done)
            }
            Task::RequestProvisioning { repository } => {
                let stack_name = self
                    .collaborators
                    .provisioner
                    .request_create(repository)
                    .await?;
                Ok(TaskOutput::Provisioning { stack_name })
            }
            Task::DescribeInfrastructure { stack_name } => Ok(TaskOutput::Infrastructure(
                self.collaborators.provisioner.describe(stack_name).await?,
            )),
            Task::RequestInfraDeletion { stack_name } => {
                self.collaborators
                    .provisioner
                    .request_delete(stack_name)
                    .await?;
                Ok(TaskOutput::Done)
            }
            Task::CreateDefaultCollection { repository } => {
                self.collaborators
                    .collections
                    .create_default_collection(repository)
                    .await?;
                Ok(TaskOutput::Done)
            }
            Task::CheckCollectionDeletions { repository_id } => Ok(TaskOutput::CollectionsDeleted(
                self.collaborators
                    .collections
                    .collections_deleted(repository_id)
                    .await?,
            )),
            Task::CleanupDocuments {
                repository_id,
                last_evaluated,
                page_size,
            } => {
                let page = self
                    .catalog
                    .cleanup_documents(repository_id, last_evaluated.as_deref(), *page_size)
                    .await?;
                self.metrics.documents_removed.add(page.removed as u64);
                Ok(TaskOutput::Cleanup(page))
            }
            Task::ListModifiedObjects {
                bucket,
                prefix,
                since,
            } => Ok(TaskOutput::Objects(
                self.collaborators
                    .objects
                    .list_modified(bucket, prefix, *since)
                    .await?,
            )),
            Task::ProcessFiles {
                repository_id,
                pipeline,
                files,
            } => Ok(TaskOutput::Processed(
                ingest::process_files(self, ctx, repository_id, pipeline, files).await?,
            )),
            Task::DeleteDocuments {
                repository_id,
                object,
            } => Ok(TaskOutput::Removed {
                documents: ingest::delete_documents(self, repository_id, object).await?,
            }),
        }
    }

    /// Conditional insert; a replay of our own earlier write is success
    async fn put_repository(&self, repository: &Repository) -> Result<TaskOutput, TaskError> {
        match self.catalog.put_repository(repository).await {
            Ok(()) => Ok(TaskOutput::Done),
            Err(err @ FlowError::RepositoryExists { .. }) => {
                match self.catalog.get_repository(&repository.id).await? {
                    Some(existing)
                        if existing.status == RepositoryStatus::CreateInProgress
                            && existing.created_at == repository.created_at =>
                    {
                        Ok(TaskOutput::Done)
                    }
                    _ => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}
