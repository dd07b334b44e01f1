//! Workflows - durable state machines over catalog and collaborator tasks
//!
//! Each workflow is an enum-tagged state plus two pure functions:
//! - `step` decides what the current state does (run a task, branch, wait,
//!   or terminate)
//! - `transition` folds a task outcome into the next state
//!
//! The engine persists the state after every transition, so a restarted
//! worker resumes from the last completed state. Neither function performs
//! I/O or reads the clock; `Context::now` is supplied by the engine.

pub mod create_store;
pub mod delete_pipeline;
pub mod delete_store;
pub mod ingest;

pub use create_store::CreateStore;
pub use delete_pipeline::DeletePipeline;
pub use delete_store::DeleteStore;
pub use ingest::IngestPipeline;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;

use crate::config::WorkflowSettings;
use crate::error::Result;
use crate::models::WorkflowKind;
use crate::tasks::{Task, TaskFailure, TaskOutput};

/// What the engine should do with the current state
#[derive(Debug, Clone, PartialEq)]
pub enum Step<S> {
    /// Invoke a task, then feed its outcome to `transition`
    Run(Task),
    /// Move to another state without side effects
    Choice(S),
    /// Suspend, then continue in `then`
    Wait { duration: Duration, then: S },
    Succeed(serde_json::Value),
    Fail(TaskFailure),
}

/// Inputs to `step` and `transition` besides the state
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub settings: &'a WorkflowSettings,
    pub now: DateTime<Utc>,
}

impl<'a> Context<'a> {
    pub fn new(settings: &'a WorkflowSettings, now: DateTime<Utc>) -> Self {
        Self { settings, now }
    }
}

/// A workflow definition
pub trait Workflow: Send + Sync + 'static {
    const KIND: WorkflowKind;

    type Input: Serialize + DeserializeOwned + Send + Sync;
    type State: Serialize + DeserializeOwned + Clone + Debug + Send + Sync;

    /// Validate the input and build the first state
    fn initial(input: Self::Input, ctx: &Context<'_>) -> Result<Self::State>;

    fn step(state: &Self::State, ctx: &Context<'_>) -> Step<Self::State>;

    fn transition(
        state: Self::State,
        outcome: std::result::Result<TaskOutput, TaskFailure>,
        ctx: &Context<'_>,
    ) -> Self::State;

    fn state_name(state: &Self::State) -> &'static str;

    /// Wall-clock budget for the whole execution
    fn timeout(_settings: &WorkflowSettings) -> Option<Duration> {
        None
    }
}

/// Failure for a task output the state did not ask for
pub(crate) fn unexpected(state: &str, output: &TaskOutput) -> TaskFailure {
    TaskFailure::new(
        "States.Runtime",
        format!("{} received unexpected task output {}", state, output.summary()),
    )
}

/// Remaining polls after one more, or a timeout failure when exhausted
pub(crate) fn next_poll(polls: u32, max: u32, what: &str) -> std::result::Result<u32, TaskFailure> {
    let next = polls.saturating_add(1);
    if next >= max.max(1) {
        Err(TaskFailure::states_timeout(format!(
            "{} still pending after {} polls",
            what, next
        )))
    } else {
        Ok(next)
    }
}
