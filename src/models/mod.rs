//! Engine records: executions, history and retry policy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::config::WorkflowSettings;

/// The four workflow definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    CreateStore,
    DeleteStore,
    IngestPipeline,
    DeletePipeline,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 4] = [
        Self::CreateStore,
        Self::DeleteStore,
        Self::IngestPipeline,
        Self::DeletePipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateStore => "create-store",
            Self::DeleteStore => "delete-store",
            Self::IngestPipeline => "ingest-pipeline",
            Self::DeletePipeline => "delete-pipeline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create-store" => Some(Self::CreateStore),
            "delete-store" => Some(Self::DeleteStore),
            "ingest-pipeline" => Some(Self::IngestPipeline),
            "delete-pipeline" => Some(Self::DeletePipeline),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting to be leased by a worker
    Queued,
    /// Leased and being driven
    Running,
    /// Suspended on a timer until `run_after`
    Waiting,
    Succeeded,
    Failed,
    /// Execution deadline exceeded
    TimedOut,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// One durable workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// UUIDv7 for time-ordering
    pub id: Uuid,
    pub workflow: WorkflowKind,
    pub status: ExecutionStatus,
    /// Name of the current state
    pub state_name: String,
    /// Serialized workflow state
    pub state: serde_json::Value,
    pub input: serde_json::Value,
    /// Settings snapshot taken at start
    pub settings: WorkflowSettings,
    pub output: Option<serde_json::Value>,
    /// Failure name, e.g. `Task.Failed`
    pub error: Option<String>,
    pub cause: Option<String>,
    /// Number of transitions applied so far
    pub transitions: i64,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Hard execution deadline
    pub deadline: Option<DateTime<Utc>>,
    /// Not eligible for leasing before this instant
    pub run_after: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        workflow: WorkflowKind,
        input: serde_json::Value,
        state_name: impl Into<String>,
        state: serde_json::Value,
        settings: WorkflowSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow,
            status: ExecutionStatus::Queued,
            state_name: state_name.into(),
            state,
            input,
            settings,
            output: None,
            error: None,
            cause: None,
            transitions: 0,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            deadline: None,
            run_after: None,
            locked_by: None,
            locked_until: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }
}

/// Position and data to persist after a transition
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub state_name: String,
    pub state: serde_json::Value,
    pub transitions: i64,
}

/// One applied transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub execution_id: Uuid,
    /// 1-based, equal to the execution's transition count after applying it
    pub sequence: i64,
    pub from_state: String,
    pub to_state: String,
    /// Task invoked by the source state, if any
    pub task: Option<String>,
    /// Outcome detail: attempts, error name, wait duration
    pub detail: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        execution_id: Uuid,
        sequence: i64,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            sequence,
            from_state: from_state.into(),
            to_state: to_state.into(),
            task: None,
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Per-task retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial delay between retries (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum delay between retries (milliseconds)
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }
}
