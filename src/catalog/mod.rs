//! Catalog - repository and document records
//!
//! The catalog is the single source of truth for repository lifecycle status
//! and document ingestion state. Every read-modify-write goes through one
//! conditional operation keyed by the record's primary key, so racing
//! workflow instances converge instead of clobbering each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Result;

/// Persisted, externally observable repository status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepositoryStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    UpdateInProgress,
    UpdateComplete,
    DeleteInProgress,
    /// Never stored: a completed delete removes the record
    DeleteComplete,
    DeleteFailed,
}

impl RepositoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::CreateFailed => "CREATE_FAILED",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::UpdateComplete => "UPDATE_COMPLETE",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteComplete => "DELETE_COMPLETE",
            Self::DeleteFailed => "DELETE_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE_IN_PROGRESS" => Some(Self::CreateInProgress),
            "CREATE_COMPLETE" => Some(Self::CreateComplete),
            "CREATE_FAILED" => Some(Self::CreateFailed),
            "UPDATE_IN_PROGRESS" => Some(Self::UpdateInProgress),
            "UPDATE_COMPLETE" => Some(Self::UpdateComplete),
            "DELETE_IN_PROGRESS" => Some(Self::DeleteInProgress),
            "DELETE_COMPLETE" => Some(Self::DeleteComplete),
            "DELETE_FAILED" => Some(Self::DeleteFailed),
            _ => None,
        }
    }

    /// Ready for ingestion and query paths
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::CreateComplete | Self::UpdateComplete)
    }

    /// Statuses a record may hold for a conditional update to `self` to apply.
    ///
    /// Re-applying the current status is allowed so replayed states are
    /// harmless. Terminal values never flow back into the in-progress value of
    /// the same lifecycle; a new delete request is the only way out of a
    /// failed lifecycle.
    pub fn allowed_predecessors(&self) -> &'static [RepositoryStatus] {
        use RepositoryStatus::*;
        match self {
            CreateInProgress => &[CreateInProgress],
            CreateComplete => &[CreateInProgress, CreateComplete],
            CreateFailed => &[CreateInProgress, CreateFailed],
            UpdateInProgress => &[CreateComplete, UpdateComplete, UpdateInProgress],
            UpdateComplete => &[UpdateInProgress, UpdateComplete],
            DeleteInProgress => &[
                CreateInProgress,
                CreateComplete,
                CreateFailed,
                UpdateInProgress,
                UpdateComplete,
                DeleteInProgress,
                DeleteFailed,
            ],
            DeleteComplete => &[],
            DeleteFailed => &[DeleteInProgress, DeleteFailed],
        }
    }

    pub fn can_transition_to(&self, next: RepositoryStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl fmt::Display for RepositoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backing-store kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryKind {
    Opensearch,
    Pgvector,
    BedrockKnowledgeBase,
}

impl RepositoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opensearch => "opensearch",
            Self::Pgvector => "pgvector",
            Self::BedrockKnowledgeBase => "bedrock_knowledge_base",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opensearch" => Some(Self::Opensearch),
            "pgvector" => Some(Self::Pgvector),
            "bedrock_knowledge_base" => Some(Self::BedrockKnowledgeBase),
            _ => None,
        }
    }
}

/// How ingestion is triggered for a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Daily,
    #[default]
    Event,
}

/// Chunking, embedding and source settings for ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub embedding_model: String,
    pub s3_bucket: String,
    pub s3_prefix: String,
    pub collection_name: String,
}

/// Repository configuration blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_config: Option<PipelineConfig>,
    /// Anything else the management API stored alongside
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Repository record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    #[serde(rename = "repositoryId")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RepositoryKind,
    pub status: RepositoryStatus,
    pub config: RepositoryConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    /// Failure detail for `*_FAILED` statuses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    /// New record in `CREATE_IN_PROGRESS`
    pub fn new(id: impl Into<String>, kind: RepositoryKind, config: RepositoryConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: RepositoryStatus::CreateInProgress,
            config,
            stack_name: None,
            status_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_stack_name(mut self, stack_name: impl Into<String>) -> Self {
        self.stack_name = Some(stack_name.into());
        self
    }

    pub fn with_status(mut self, status: RepositoryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

/// Reference to a source object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            last_modified: None,
        }
    }

    /// Key up to and including the last `/`, empty for top-level keys
    pub fn prefix(&self) -> &str {
        match self.key.rfind('/') {
            Some(idx) => &self.key[..=idx],
            None => "",
        }
    }
}

/// Ingestion status of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Ingested,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Ingested => "ingested",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "ingested" => Some(Self::Ingested),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Document record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(rename = "documentId")]
    pub id: Uuid,
    pub repository_id: String,
    pub collection: String,
    pub partition_key: String,
    pub source: ObjectRef,
    pub status: DocumentStatus,
    pub chunk_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Deterministic id, so replays of the same file land on the same record
    pub fn id_for(repository_id: &str, collection: &str, source: &ObjectRef) -> Uuid {
        let name = format!(
            "kbflow:{}/{}/{}/{}",
            repository_id, collection, source.bucket, source.key
        );
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }

    pub fn partition_key(repository_id: &str, collection: &str) -> String {
        format!("{}#{}", repository_id, collection)
    }

    pub fn new(repository_id: &str, collection: &str, source: ObjectRef) -> Self {
        let now = Utc::now();
        Self {
            id: Self::id_for(repository_id, collection, &source),
            repository_id: repository_id.to_string(),
            collection: collection.to_string(),
            partition_key: Self::partition_key(repository_id, collection),
            source,
            status: DocumentStatus::Processing,
            chunk_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Chunk record belonging to a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubDocument {
    pub id: String,
    pub document_id: Uuid,
    pub repository_id: String,
    pub ordinal: u32,
    /// Index-side reference returned by the indexer
    pub chunk_ref: String,
}

impl SubDocument {
    pub fn new(document: &Document, ordinal: u32, chunk_ref: impl Into<String>) -> Self {
        Self {
            id: format!("{}:{}", document.id, ordinal),
            document_id: document.id,
            repository_id: document.repository_id.clone(),
            ordinal,
            chunk_ref: chunk_ref.into(),
        }
    }
}

/// Result of removing one page of documents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPage {
    pub removed: usize,
    /// Present only when more documents remain
    pub last_evaluated: Option<String>,
}

/// Durable catalog operations
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    // =========================================================================
    // Repositories
    // =========================================================================

    /// Insert a repository record.
    ///
    /// Succeeds only when no record exists or the existing one is
    /// `CREATE_FAILED`; otherwise fails with `RepositoryExists`.
    async fn put_repository(&self, repository: &Repository) -> Result<()>;

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>>;

    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    /// Compare-and-set the status against `to.allowed_predecessors()`.
    ///
    /// `stack_name` is only written when `Some`. `reason` replaces the stored
    /// status reason.
    async fn transition_repository(
        &self,
        id: &str,
        to: RepositoryStatus,
        stack_name: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Repository>;

    /// Remove a repository record, returns whether it existed
    async fn delete_repository(&self, id: &str) -> Result<bool>;

    // =========================================================================
    // Documents
    // =========================================================================

    /// Insert or replace a document record keyed by its id
    async fn upsert_document(&self, document: &Document) -> Result<()>;

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>>;

    async fn find_documents_by_source(
        &self,
        repository_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<Document>>;

    async fn count_documents(&self, repository_id: &str) -> Result<u64>;

    /// Replace all chunk records of a document
    async fn replace_sub_documents(&self, document_id: Uuid, chunks: &[SubDocument])
        -> Result<()>;

    async fn list_sub_documents(&self, document_id: Uuid) -> Result<Vec<SubDocument>>;

    /// Remove a document and its chunks, returns whether it existed
    async fn delete_document(&self, id: Uuid) -> Result<bool>;

    /// Remove up to `page_size` documents (with their chunks) ordered by id
    /// after `last_evaluated`.
    async fn cleanup_documents(
        &self,
        repository_id: &str,
        last_evaluated: Option<&str>,
        page_size: usize,
    ) -> Result<CleanupPage>;
}
