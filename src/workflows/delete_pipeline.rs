//! Delete-Pipeline: normalize an object-deleted event, remove its documents

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{unexpected, Context, Step, Workflow};
use crate::catalog::ObjectRef;
use crate::error::{FlowError, Result};
use crate::models::WorkflowKind;
use crate::tasks::{Task, TaskFailure, TaskOutput};

pub struct DeletePipeline;

/// Where the deleted object lived, once extracted from the event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTarget {
    pub repository_id: String,
    pub bucket: String,
    pub key: String,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePipelineState {
    /// The raw notification
    pub event: Value,
    #[serde(default)]
    pub target: Option<DeleteTarget>,
    #[serde(default)]
    pub documents_removed: usize,
    pub at: DeletePipelinePhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DeletePipelinePhase {
    NormalizeEvent,
    InvokeDeleteTask,
    Succeeded,
    Failed { failure: TaskFailure },
}

impl DeletePipelinePhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NormalizeEvent => "NormalizeEvent",
            Self::InvokeDeleteTask => "InvokeDeleteTask",
            Self::Succeeded => "Succeeded",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl DeletePipelineState {
    fn to(mut self, at: DeletePipelinePhase) -> Self {
        self.at = at;
        self
    }
}

fn string_at<'a>(event: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .filter_map(|p| event.pointer(p).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

/// Accepts a flat payload or a storage notification with a `detail` body
pub fn normalize(event: &Value) -> std::result::Result<DeleteTarget, TaskFailure> {
    let repository_id = string_at(event, &["/repositoryId", "/detail/repositoryId"]);
    let bucket = string_at(event, &["/bucket", "/detail/bucket/name", "/detail/bucket"]);
    let key = string_at(event, &["/key", "/detail/object/key", "/detail/key"]);

    let (repository_id, bucket, key) = match (repository_id, bucket, key) {
        (Some(r), Some(b), Some(k)) => (r, b, k),
        (r, b, k) => {
            let missing: Vec<&str> = [("repositoryId", r), ("bucket", b), ("key", k)]
                .iter()
                .filter(|(_, v)| v.is_none())
                .map(|(name, _)| *name)
                .collect();
            return Err(TaskFailure::new(
                "Pipeline.InvalidEvent",
                format!("deletion event missing {}", missing.join(", ")),
            ));
        }
    };

    let object = ObjectRef::new(bucket, key);
    let prefix = string_at(event, &["/prefix", "/detail/prefix"])
        .map(str::to_string)
        .unwrap_or_else(|| object.prefix().to_string());

    Ok(DeleteTarget {
        repository_id: repository_id.to_string(),
        bucket: object.bucket,
        key: object.key,
        prefix,
    })
}

impl Workflow for DeletePipeline {
    const KIND: WorkflowKind = WorkflowKind::DeletePipeline;

    type Input = Value;
    type State = DeletePipelineState;

    fn initial(input: Value, _ctx: &Context<'_>) -> Result<DeletePipelineState> {
        if !input.is_object() {
            return Err(FlowError::InvalidInput(
                "deletion event must be a JSON object".into(),
            ));
        }
        Ok(DeletePipelineState {
            event: input,
            target: None,
            documents_removed: 0,
            at: DeletePipelinePhase::NormalizeEvent,
        })
    }

    fn step(state: &DeletePipelineState, _ctx: &Context<'_>) -> Step<DeletePipelineState> {
        match &state.at {
            DeletePipelinePhase::NormalizeEvent => match normalize(&state.event) {
                Ok(target) => {
                    let mut next = state.clone().to(DeletePipelinePhase::InvokeDeleteTask);
                    next.target = Some(target);
                    Step::Choice(next)
                }
                Err(failure) => {
                    Step::Choice(state.clone().to(DeletePipelinePhase::Failed { failure }))
                }
            },
            DeletePipelinePhase::InvokeDeleteTask => match &state.target {
                Some(target) => Step::Run(Task::DeleteDocuments {
                    repository_id: target.repository_id.clone(),
                    object: ObjectRef::new(target.bucket.clone(), target.key.clone()),
                }),
                None => Step::Choice(state.clone().to(DeletePipelinePhase::NormalizeEvent)),
            },
            DeletePipelinePhase::Succeeded => Step::Succeed(serde_json::json!({
                "target": state.target,
                "documentsRemoved": state.documents_removed,
            })),
            DeletePipelinePhase::Failed { failure } => Step::Fail(failure.clone()),
        }
    }

    fn transition(
        state: DeletePipelineState,
        outcome: std::result::Result<TaskOutput, TaskFailure>,
        _ctx: &Context<'_>,
    ) -> DeletePipelineState {
        let name = state.at.name();
        match (state.at.clone(), outcome) {
            (DeletePipelinePhase::InvokeDeleteTask, Ok(TaskOutput::Removed { documents })) => {
                let mut state = state;
                state.documents_removed = documents;
                state.to(DeletePipelinePhase::Succeeded)
            }
            (DeletePipelinePhase::InvokeDeleteTask, Ok(output)) => {
                let failure = unexpected(name, &output);
                state.to(DeletePipelinePhase::Failed { failure })
            }
            (DeletePipelinePhase::InvokeDeleteTask, Err(failure)) => {
                state.to(DeletePipelinePhase::Failed { failure })
            }
            (
                DeletePipelinePhase::NormalizeEvent
                | DeletePipelinePhase::Succeeded
                | DeletePipelinePhase::Failed { .. },
                _,
            ) => state,
        }
    }

    fn state_name(state: &DeletePipelineState) -> &'static str {
        state.at.name()
    }
}
