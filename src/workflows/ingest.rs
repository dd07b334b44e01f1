//! Ingest-Pipeline: resolve the repository, collect files, fan out

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{unexpected, Context, Step, Workflow};
use crate::catalog::{ObjectRef, PipelineConfig};
use crate::config::WorkflowSettings;
use crate::error::{FlowError, Result};
use crate::models::WorkflowKind;
use crate::tasks::{FileOutcome, Task, TaskFailure, TaskOutput};

pub struct IngestPipeline;

/// What started the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Daily,
    /// Anything other than `daily` is treated as a single-object event
    #[default]
    #[serde(other)]
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestInput {
    pub repository_id: String,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_config: Option<PipelineConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestState {
    pub input: IngestInput,
    /// Resolved from the payload or the catalog
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub files: Vec<ObjectRef>,
    #[serde(default)]
    pub results: Vec<FileOutcome>,
    pub at: IngestPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum IngestPhase {
    ResolveRepository,
    DetermineTrigger,
    ListModifiedObjects,
    PrepareSingleFileList,
    ProcessFiles,
    Succeeded,
    Failed { failure: TaskFailure },
}

impl IngestPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResolveRepository => "ResolveRepository",
            Self::DetermineTrigger => "DetermineTrigger",
            Self::ListModifiedObjects => "ListModifiedObjects",
            Self::PrepareSingleFileList => "PrepareSingleFileList",
            Self::ProcessFiles => "ProcessFiles",
            Self::Succeeded => "Succeeded",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl IngestState {
    fn to(mut self, at: IngestPhase) -> Self {
        self.at = at;
        self
    }

    fn fail(self, failure: TaskFailure) -> Self {
        self.to(IngestPhase::Failed { failure })
    }

    /// Payload bucket, else the pipeline's source bucket
    fn bucket(&self) -> Option<String> {
        self.input
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .or_else(|| self.pipeline.as_ref().map(|p| p.s3_bucket.clone()))
    }

    fn prefix(&self) -> String {
        self.input
            .prefix
            .clone()
            .or_else(|| self.pipeline.as_ref().map(|p| p.s3_prefix.clone()))
            .unwrap_or_default()
    }
}

impl Workflow for IngestPipeline {
    const KIND: WorkflowKind = WorkflowKind::IngestPipeline;

    type Input = IngestInput;
    type State = IngestState;

    fn initial(input: IngestInput, _ctx: &Context<'_>) -> Result<IngestState> {
        if input.repository_id.trim().is_empty() {
            return Err(FlowError::InvalidInput("repositoryId is required".into()));
        }

        Ok(IngestState {
            pipeline: input.pipeline_config.clone(),
            input,
            files: vec![],
            results: vec![],
            at: IngestPhase::ResolveRepository,
        })
    }

    fn step(state: &IngestState, ctx: &Context<'_>) -> Step<IngestState> {
        match &state.at {
            IngestPhase::ResolveRepository => Step::Run(Task::GetRepository {
                repository_id: state.input.repository_id.clone(),
            }),
            IngestPhase::DetermineTrigger => match state.input.trigger {
                Trigger::Daily => Step::Choice(state.clone().to(IngestPhase::ListModifiedObjects)),
                Trigger::Event => Step::Choice(state.clone().to(IngestPhase::PrepareSingleFileList)),
            },
            IngestPhase::ListModifiedObjects => match state.bucket() {
                Some(bucket) => Step::Run(Task::ListModifiedObjects {
                    bucket,
                    prefix: state.prefix(),
                    since: ctx.now - chrono::Duration::hours(ctx.settings.lookback_hours),
                }),
                None => Step::Choice(state.clone().fail(TaskFailure::new(
                    "Ingest.InvalidInput",
                    "no source bucket in payload or pipeline config",
                ))),
            },
            IngestPhase::PrepareSingleFileList => {
                let key = state.input.key.clone().filter(|k| !k.is_empty());
                match (state.bucket(), key) {
                    (Some(bucket), Some(key)) => {
                        let mut next = state.clone().to(IngestPhase::ProcessFiles);
                        next.files = vec![ObjectRef::new(bucket, key)];
                        Step::Choice(next)
                    }
                    _ => Step::Choice(state.clone().fail(TaskFailure::new(
                        "Ingest.InvalidInput",
                        "event trigger requires bucket and key",
                    ))),
                }
            }
            IngestPhase::ProcessFiles => match &state.pipeline {
                _ if state.files.is_empty() => Step::Choice(state.clone().to(IngestPhase::Succeeded)),
                Some(pipeline) => Step::Run(Task::ProcessFiles {
                    repository_id: state.input.repository_id.clone(),
                    pipeline: pipeline.clone(),
                    files: state.files.clone(),
                }),
                None => Step::Choice(state.clone().fail(missing_pipeline())),
            },
            IngestPhase::Succeeded => Step::Succeed(serde_json::json!({
                "repositoryId": state.input.repository_id,
                "trigger": state.input.trigger,
                "files": state.files.len(),
                "results": state.results,
            })),
            IngestPhase::Failed { failure } => Step::Fail(failure.clone()),
        }
    }

    fn transition(
        state: IngestState,
        outcome: std::result::Result<TaskOutput, TaskFailure>,
        _ctx: &Context<'_>,
    ) -> IngestState {
        let name = state.at.name();
        match (state.at.clone(), outcome) {
            (IngestPhase::ResolveRepository, Ok(TaskOutput::Repository(None))) => {
                let cause = format!("repository {} does not exist", state.input.repository_id);
                state.fail(TaskFailure::new("Catalog.RepositoryNotFound", cause))
            }
            (IngestPhase::ResolveRepository, Ok(TaskOutput::Repository(Some(record)))) => {
                if !record.is_ready() {
                    let cause = format!("repository {} is {}", record.id, record.status);
                    return state.fail(TaskFailure::new("Ingest.RepositoryNotReady", cause));
                }
                let mut state = state;
                if state.pipeline.is_none() {
                    state.pipeline = record.config.pipeline_config;
                }
                if state.pipeline.is_none() {
                    return state.fail(missing_pipeline());
                }
                state.to(IngestPhase::DetermineTrigger)
            }

            (IngestPhase::ListModifiedObjects, Ok(TaskOutput::Objects(objects))) => {
                let mut state = state;
                state.files = objects;
                state.to(IngestPhase::ProcessFiles)
            }

            (IngestPhase::ProcessFiles, Ok(TaskOutput::Processed(results))) => {
                let mut state = state;
                state.results = results;
                state.to(IngestPhase::Succeeded)
            }

            (
                IngestPhase::ResolveRepository
                | IngestPhase::ListModifiedObjects
                | IngestPhase::ProcessFiles,
                Err(failure),
            ) => state.fail(failure),

            (
                IngestPhase::ResolveRepository
                | IngestPhase::ListModifiedObjects
                | IngestPhase::ProcessFiles,
                Ok(output),
            ) => state.fail(unexpected(name, &output)),

            (
                IngestPhase::DetermineTrigger
                | IngestPhase::PrepareSingleFileList
                | IngestPhase::Succeeded
                | IngestPhase::Failed { .. },
                _,
            ) => state,
        }
    }

    fn state_name(state: &IngestState) -> &'static str {
        state.at.name()
    }

    fn timeout(settings: &WorkflowSettings) -> Option<Duration> {
        Some(settings.ingest_timeout())
    }
}

fn missing_pipeline() -> TaskFailure {
    TaskFailure::new(
        "Ingest.MissingPipelineConfig",
        "no pipelineConfig in payload or repository config",
    )
}
