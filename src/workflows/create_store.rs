//! Create-Store: catalog entry, provisioning, optional default collection

use serde::{Deserialize, Serialize};

use super::{next_poll, unexpected, Context, Step, Workflow};
use crate::catalog::{PipelineConfig, Repository, RepositoryConfig, RepositoryKind, RepositoryStatus};
use crate::error::{FlowError, Result};
use crate::models::WorkflowKind;
use crate::tasks::{InfraStatus, Task, TaskFailure, TaskOutput};

pub struct CreateStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStoreInput {
    pub repository_id: String,
    #[serde(rename = "type")]
    pub kind: RepositoryKind,
    #[serde(default)]
    pub config: RepositoryConfig,
    /// Shorthand for `config.pipelineConfig`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_config: Option<PipelineConfig>,
    /// Requested name for the infrastructure unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStoreState {
    pub repository: Repository,
    pub at: CreatePhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum CreatePhase {
    CreateCatalogEntry,
    RequestProvisioning,
    PollStatus { polls: u32 },
    WaitForProvisioning { polls: u32 },
    CreateDefaultCollection,
    UpdateSuccessStatus,
    UpdateFailureStatus { failure: TaskFailure },
    Succeeded,
    Failed { failure: TaskFailure },
}

impl CreatePhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateCatalogEntry => "CreateCatalogEntry",
            Self::RequestProvisioning => "RequestProvisioning",
            Self::PollStatus { .. } => "PollStatus",
            Self::WaitForProvisioning { .. } => "WaitForProvisioning",
            Self::CreateDefaultCollection => "CreateDefaultCollectionIfNeeded",
            Self::UpdateSuccessStatus => "UpdateSuccessStatus",
            Self::UpdateFailureStatus { .. } => "UpdateFailureStatus",
            Self::Succeeded => "Succeeded",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl CreateStoreState {
    fn to(mut self, at: CreatePhase) -> Self {
        self.at = at;
        self
    }

    fn fail(self, failure: TaskFailure) -> Self {
        self.to(CreatePhase::UpdateFailureStatus { failure })
    }

    /// Infrastructure is up; only knowledge bases get a default collection
    fn after_infrastructure(self) -> Self {
        match self.repository.kind {
            RepositoryKind::BedrockKnowledgeBase => self.to(CreatePhase::CreateDefaultCollection),
            RepositoryKind::Opensearch | RepositoryKind::Pgvector => {
                self.to(CreatePhase::UpdateSuccessStatus)
            }
        }
    }
}

impl Workflow for CreateStore {
    const KIND: WorkflowKind = WorkflowKind::CreateStore;

    type Input = CreateStoreInput;
    type State = CreateStoreState;

    fn initial(input: CreateStoreInput, _ctx: &Context<'_>) -> Result<CreateStoreState> {
        let repository_id = input.repository_id.trim();
        if repository_id.is_empty() {
            return Err(FlowError::InvalidInput("repositoryId is required".into()));
        }

        let mut config = input.config;
        if let Some(pipeline) = input.pipeline_config {
            config.pipeline_config = Some(pipeline);
        }

        let mut repository = Repository::new(repository_id, input.kind, config);
        repository.stack_name = input.stack_name.filter(|s| !s.is_empty());

        Ok(CreateStoreState {
            repository,
            at: CreatePhase::CreateCatalogEntry,
        })
    }

    fn step(state: &CreateStoreState, ctx: &Context<'_>) -> Step<CreateStoreState> {
        let repository = &state.repository;
        match &state.at {
            CreatePhase::CreateCatalogEntry => Step::Run(Task::PutRepository {
                repository: repository.clone(),
            }),
            CreatePhase::RequestProvisioning => Step::Run(Task::RequestProvisioning {
                repository: repository.clone(),
            }),
            CreatePhase::PollStatus { .. } => match &repository.stack_name {
                Some(stack_name) => Step::Run(Task::DescribeInfrastructure {
                    stack_name: stack_name.clone(),
                }),
                None => Step::Choice(state.clone().fail(TaskFailure::new(
                    "Provisioning.MissingStack",
                    "no stack to poll",
                ))),
            },
            CreatePhase::WaitForProvisioning { polls } => Step::Wait {
                duration: ctx.settings.provisioning_poll_interval(),
                then: state.clone().to(CreatePhase::PollStatus { polls: *polls }),
            },
            CreatePhase::CreateDefaultCollection => Step::Run(Task::CreateDefaultCollection {
                repository: repository.clone(),
            }),
            CreatePhase::UpdateSuccessStatus => Step::Run(Task::SetRepositoryStatus {
                repository_id: repository.id.clone(),
                status: RepositoryStatus::CreateComplete,
                stack_name: repository.stack_name.clone(),
                reason: None,
            }),
            CreatePhase::UpdateFailureStatus { failure } => Step::Run(Task::SetRepositoryStatus {
                repository_id: repository.id.clone(),
                status: RepositoryStatus::CreateFailed,
                stack_name: repository.stack_name.clone(),
                reason: Some(failure.to_string()),
            }),
            CreatePhase::Succeeded => Step::Succeed(serde_json::json!({
                "repositoryId": repository.id,
                "status": RepositoryStatus::CreateComplete,
                "stackName": repository.stack_name,
            })),
            CreatePhase::Failed { failure } => Step::Fail(failure.clone()),
        }
    }

    fn transition(
        state: CreateStoreState,
        outcome: std::result::Result<TaskOutput, TaskFailure>,
        ctx: &Context<'_>,
    ) -> CreateStoreState {
        let name = state.at.name();
        match (state.at.clone(), outcome) {
            // a live record belongs to another request; leave it alone
            (CreatePhase::CreateCatalogEntry, Err(failure)) => {
                state.to(CreatePhase::Failed { failure })
            }
            (CreatePhase::CreateCatalogEntry, Ok(_)) => state.to(CreatePhase::RequestProvisioning),

            (CreatePhase::RequestProvisioning, Ok(TaskOutput::Provisioning { stack_name })) => {
                let mut state = state;
                if let Some(stack_name) = stack_name {
                    state.repository.stack_name = Some(stack_name);
                    state.to(CreatePhase::PollStatus { polls: 0 })
                } else {
                    state.repository.stack_name = None;
                    state.after_infrastructure()
                }
            }

            (CreatePhase::PollStatus { polls }, Ok(TaskOutput::Infrastructure(status))) => {
                if status.is_created() {
                    state.after_infrastructure()
                } else if status.is_creating() {
                    match next_poll(polls, ctx.settings.max_provisioning_polls, "provisioning") {
                        Ok(polls) => state.to(CreatePhase::WaitForProvisioning { polls }),
                        Err(failure) => state.fail(failure),
                    }
                } else {
                    state.fail(provisioning_failed(status))
                }
            }

            (CreatePhase::CreateDefaultCollection, Ok(_)) => {
                state.to(CreatePhase::UpdateSuccessStatus)
            }

            (CreatePhase::UpdateSuccessStatus, Ok(_)) => state.to(CreatePhase::Succeeded),
            (CreatePhase::UpdateSuccessStatus, Err(failure)) => state.fail(failure),

            // the original failure is what callers need to see
            (CreatePhase::UpdateFailureStatus { failure }, _) => {
                state.to(CreatePhase::Failed { failure })
            }

            (
                CreatePhase::RequestProvisioning
                | CreatePhase::PollStatus { .. }
                | CreatePhase::CreateDefaultCollection,
                Err(failure),
            ) => state.fail(failure),

            (
                CreatePhase::RequestProvisioning | CreatePhase::PollStatus { .. },
                Ok(output),
            ) => state.fail(unexpected(name, &output)),

            (
                CreatePhase::WaitForProvisioning { .. }
                | CreatePhase::Succeeded
                | CreatePhase::Failed { .. },
                _,
            ) => state,
        }
    }

    fn state_name(state: &CreateStoreState) -> &'static str {
        state.at.name()
    }
}

fn provisioning_failed(status: InfraStatus) -> TaskFailure {
    let cause = serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", status));
    TaskFailure::new("Provisioning.Failed", cause)
}
