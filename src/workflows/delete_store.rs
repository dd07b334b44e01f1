//! Delete-Store: collection teardown, paginated document cleanup,
//! infrastructure teardown, catalog removal

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{next_poll, unexpected, Context, Step, Workflow};
use crate::catalog::{RepositoryKind, RepositoryStatus};
use crate::error::{FlowError, Result};
use crate::models::WorkflowKind;
use crate::tasks::{Task, TaskFailure, TaskOutput};

pub struct DeleteStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteStoreInput {
    pub repository_id: String,
    #[serde(default)]
    pub skip_document_removal: bool,
    /// Infrastructure unit to tear down when the record has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    /// Resume document cleanup from this cursor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteStoreState {
    pub repository_id: String,
    pub skip_document_removal: bool,
    #[serde(default)]
    pub requested_stack_name: Option<String>,
    #[serde(default)]
    pub start_cursor: Option<String>,
    #[serde(default)]
    pub cleanup_pages: u32,
    #[serde(default)]
    pub documents_removed: u64,
    pub at: DeletePhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DeletePhase {
    MarkDeleteInProgress,
    ShouldSkipDocumentCleanup,
    CheckCollectionDeletions {
        polls: u32,
    },
    WaitForCollectionDeletions {
        polls: u32,
    },
    CleanupDocuments {
        #[serde(default)]
        last_evaluated: Option<String>,
        /// Budget for the whole loop, fixed when the loop is entered
        deadline: DateTime<Utc>,
    },
    LoadRepositoryRecord,
    RequestInfraDeletion {
        stack_name: String,
    },
    PollDeletionStatus {
        stack_name: String,
        polls: u32,
    },
    WaitForInfraDeletion {
        stack_name: String,
        polls: u32,
    },
    DeleteCatalogEntry,
    UpdateFailureStatus {
        failure: TaskFailure,
    },
    Succeeded,
    Failed {
        failure: TaskFailure,
    },
}

impl DeletePhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MarkDeleteInProgress => "MarkDeleteInProgress",
            Self::ShouldSkipDocumentCleanup => "ShouldSkipDocumentCleanup",
            Self::CheckCollectionDeletions { .. } => "CheckCollectionDeletions",
            Self::WaitForCollectionDeletions { .. } => "WaitForCollectionDeletions",
            Self::CleanupDocuments { .. } => "CleanupDocumentsPaginated",
            Self::LoadRepositoryRecord => "LoadRepositoryRecord",
            Self::RequestInfraDeletion { .. } => "RequestInfraDeletion",
            Self::PollDeletionStatus { .. } => "PollDeletionStatus",
            Self::WaitForInfraDeletion { .. } => "WaitForInfraDeletion",
            Self::DeleteCatalogEntry => "DeleteCatalogEntry",
            Self::UpdateFailureStatus { .. } => "UpdateFailureStatus",
            Self::Succeeded => "Succeeded",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl DeleteStoreState {
    fn to(mut self, at: DeletePhase) -> Self {
        self.at = at;
        self
    }

    fn fail(self, failure: TaskFailure) -> Self {
        self.to(DeletePhase::UpdateFailureStatus { failure })
    }
}

impl Workflow for DeleteStore {
    const KIND: WorkflowKind = WorkflowKind::DeleteStore;

    type Input = DeleteStoreInput;
    type State = DeleteStoreState;

    fn initial(input: DeleteStoreInput, _ctx: &Context<'_>) -> Result<DeleteStoreState> {
        let repository_id = input.repository_id.trim();
        if repository_id.is_empty() {
            return Err(FlowError::InvalidInput("repositoryId is required".into()));
        }

        Ok(DeleteStoreState {
            repository_id: repository_id.to_string(),
            skip_document_removal: input.skip_document_removal,
            requested_stack_name: input.stack_name.filter(|s| !s.is_empty()),
            start_cursor: input.last_evaluated.filter(|s| !s.is_empty()),
            cleanup_pages: 0,
            documents_removed: 0,
            at: DeletePhase::MarkDeleteInProgress,
        })
    }

    fn step(state: &DeleteStoreState, ctx: &Context<'_>) -> Step<DeleteStoreState> {
        let repository_id = state.repository_id.clone();
        match &state.at {
            DeletePhase::MarkDeleteInProgress => Step::Run(Task::SetRepositoryStatus {
                repository_id,
                status: RepositoryStatus::DeleteInProgress,
                stack_name: None,
                reason: None,
            }),
            DeletePhase::ShouldSkipDocumentCleanup => {
                if state.skip_document_removal {
                    Step::Choice(state.clone().to(DeletePhase::LoadRepositoryRecord))
                } else {
                    Step::Choice(
                        state
                            .clone()
                            .to(DeletePhase::CheckCollectionDeletions { polls: 0 }),
                    )
                }
            }
            DeletePhase::CheckCollectionDeletions { .. } => {
                Step::Run(Task::CheckCollectionDeletions { repository_id })
            }
            DeletePhase::WaitForCollectionDeletions { polls } => Step::Wait {
                duration: ctx.settings.collection_poll_interval(),
                then: state
                    .clone()
                    .to(DeletePhase::CheckCollectionDeletions { polls: *polls }),
            },
            DeletePhase::CleanupDocuments {
                last_evaluated,
                deadline,
            } => {
                if ctx.now >= *deadline {
                    Step::Choice(state.clone().fail(TaskFailure::states_timeout(format!(
                        "document cleanup exceeded {}s after {} pages",
                        ctx.settings.cleanup_timeout_secs, state.cleanup_pages
                    ))))
                } else {
                    Step::Run(Task::CleanupDocuments {
                        repository_id,
                        last_evaluated: last_evaluated.clone(),
                        page_size: ctx.settings.cleanup_page_size.max(1),
                    })
                }
            }
            DeletePhase::LoadRepositoryRecord => Step::Run(Task::GetRepository { repository_id }),
            DeletePhase::RequestInfraDeletion { stack_name } => {
                Step::Run(Task::RequestInfraDeletion {
                    stack_name: stack_name.clone(),
                })
            }
            DeletePhase::PollDeletionStatus { stack_name, .. } => {
                Step::Run(Task::DescribeInfrastructure {
                    stack_name: stack_name.clone(),
                })
            }
            DeletePhase::WaitForInfraDeletion { stack_name, polls } => Step::Wait {
                duration: ctx.settings.deletion_poll_interval(),
                then: state.clone().to(DeletePhase::PollDeletionStatus {
                    stack_name: stack_name.clone(),
                    polls: *polls,
                }),
            },
            DeletePhase::DeleteCatalogEntry => Step::Run(Task::DeleteRepository { repository_id }),
            DeletePhase::UpdateFailureStatus { failure } => Step::Run(Task::SetRepositoryStatus {
                repository_id,
                status: RepositoryStatus::DeleteFailed,
                stack_name: None,
                reason: Some(failure.to_string()),
            }),
            DeletePhase::Succeeded => Step::Succeed(serde_json::json!({
                "repositoryId": state.repository_id,
                "status": RepositoryStatus::DeleteComplete,
                "cleanupPages": state.cleanup_pages,
                "documentsRemoved": state.documents_removed,
            })),
            DeletePhase::Failed { failure } => Step::Fail(failure.clone()),
        }
    }

    fn transition(
        state: DeleteStoreState,
        outcome: std::result::Result<TaskOutput, TaskFailure>,
        ctx: &Context<'_>,
    ) -> DeleteStoreState {
        let name = state.at.name();
        match (state.at.clone(), outcome) {
            (DeletePhase::MarkDeleteInProgress, Ok(_)) => {
                state.to(DeletePhase::ShouldSkipDocumentCleanup)
            }
            // nothing was marked, so there is no status to roll forward
            (DeletePhase::MarkDeleteInProgress, Err(failure)) => {
                state.to(DeletePhase::Failed { failure })
            }

            (
                DeletePhase::CheckCollectionDeletions { polls },
                Ok(TaskOutput::CollectionsDeleted(done)),
            ) => {
                if done {
                    let deadline = ctx.now
                        + chrono::Duration::seconds(ctx.settings.cleanup_timeout_secs as i64);
                    let last_evaluated = state.start_cursor.clone();
                    state.to(DeletePhase::CleanupDocuments {
                        last_evaluated,
                        deadline,
                    })
                } else {
                    match next_poll(polls, ctx.settings.max_collection_polls, "collection deletion")
                    {
                        Ok(polls) => state.to(DeletePhase::WaitForCollectionDeletions { polls }),
                        Err(failure) => state.fail(failure),
                    }
                }
            }

            (DeletePhase::CleanupDocuments { deadline, .. }, Ok(TaskOutput::Cleanup(page))) => {
                let mut state = state;
                state.cleanup_pages += 1;
                state.documents_removed += page.removed as u64;
                match page.last_evaluated {
                    Some(cursor) => state.to(DeletePhase::CleanupDocuments {
                        last_evaluated: Some(cursor),
                        deadline,
                    }),
                    None => state.to(DeletePhase::LoadRepositoryRecord),
                }
            }

            // replay after the record was already removed
            (DeletePhase::LoadRepositoryRecord, Ok(TaskOutput::Repository(None))) => {
                state.to(DeletePhase::Succeeded)
            }
            (DeletePhase::LoadRepositoryRecord, Ok(TaskOutput::Repository(Some(record)))) => {
                let stack_name = match (record.kind, record.stack_name) {
                    (_, Some(stack_name)) => Some(stack_name),
                    (RepositoryKind::BedrockKnowledgeBase, None) => None,
                    (RepositoryKind::Opensearch | RepositoryKind::Pgvector, None) => {
                        state.requested_stack_name.clone()
                    }
                };
                match stack_name {
                    Some(stack_name) => state.to(DeletePhase::RequestInfraDeletion { stack_name }),
                    None => state.to(DeletePhase::DeleteCatalogEntry),
                }
            }

            (DeletePhase::RequestInfraDeletion { stack_name }, Ok(_)) => {
                state.to(DeletePhase::PollDeletionStatus {
                    stack_name,
                    polls: 0,
                })
            }

            (
                DeletePhase::PollDeletionStatus { stack_name, polls },
                Ok(TaskOutput::Infrastructure(status)),
            ) => {
                if status.is_deleted() {
                    state.to(DeletePhase::DeleteCatalogEntry)
                } else if status.is_delete_failed() {
                    state.fail(TaskFailure::new(
                        "Infrastructure.DeleteFailed",
                        format!("{} reported DELETE_FAILED", stack_name),
                    ))
                } else {
                    match next_poll(polls, ctx.settings.max_deletion_polls, "infrastructure deletion")
                    {
                        Ok(polls) => {
                            state.to(DeletePhase::WaitForInfraDeletion { stack_name, polls })
                        }
                        Err(failure) => state.fail(failure),
                    }
                }
            }
            // describe fails once the stack is gone
            (DeletePhase::PollDeletionStatus { .. }, Err(_)) => {
                state.to(DeletePhase::DeleteCatalogEntry)
            }

            (DeletePhase::DeleteCatalogEntry, Ok(_)) => state.to(DeletePhase::Succeeded),

            (DeletePhase::UpdateFailureStatus { failure }, _) => {
                state.to(DeletePhase::Failed { failure })
            }

            (
                DeletePhase::CheckCollectionDeletions { .. }
                | DeletePhase::CleanupDocuments { .. }
                | DeletePhase::LoadRepositoryRecord
                | DeletePhase::RequestInfraDeletion { .. }
                | DeletePhase::DeleteCatalogEntry,
                Err(failure),
            ) => state.fail(failure),

            (
                DeletePhase::CheckCollectionDeletions { .. }
                | DeletePhase::CleanupDocuments { .. }
                | DeletePhase::LoadRepositoryRecord
                | DeletePhase::PollDeletionStatus { .. },
                Ok(output),
            ) => state.fail(unexpected(name, &output)),

            (
                DeletePhase::ShouldSkipDocumentCleanup
                | DeletePhase::WaitForCollectionDeletions { .. }
                | DeletePhase::WaitForInfraDeletion { .. }
                | DeletePhase::Succeeded
                | DeletePhase::Failed { .. },
                _,
            ) => state,
        }
    }

    fn state_name(state: &DeleteStoreState) -> &'static str {
        state.at.name()
    }
}
