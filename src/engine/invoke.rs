//! Task invocation with the per-task retry policy

use serde_json::json;
use tracing::{debug, warn};

use crate::models::RetryConfig;
use crate::tasks::retry::with_retry;
use crate::tasks::{Services, Task, TaskContext, TaskFailure, TaskOutput};

/// Settled outcome of one task invocation
#[derive(Debug)]
pub struct Invocation {
    pub outcome: Result<TaskOutput, TaskFailure>,
    pub attempts: u32,
}

impl Invocation {
    /// History detail for the transition this invocation caused
    pub fn detail(&self) -> serde_json::Value {
        match &self.outcome {
            Ok(output) => json!({
                "attempts": self.attempts,
                "output": output.summary(),
            }),
            Err(failure) => json!({
                "attempts": self.attempts,
                "error": failure.error,
                "cause": failure.cause,
            }),
        }
    }
}

/// Run a task to a settled outcome.
///
/// Transient errors and attempt timeouts are retried with backoff; anything
/// else settles immediately. Fan-out tasks retry per item instead.
pub async fn invoke(services: &Services, task: &Task, ctx: &TaskContext) -> Invocation {
    let single = RetryConfig::immediate(1);
    let policy = if task.is_retryable() {
        &ctx.settings.retry
    } else {
        &single
    };

    let attempted = with_retry(policy, task.timeout(&ctx.settings), move |attempt| {
        debug!(task = task.name(), attempt = attempt, "Invoking task");
        services.perform(task, ctx)
    })
    .await;

    services.metrics.record_attempts(attempted.attempts);

    let outcome = attempted.result.map_err(|e| {
        services.metrics.task_failures.inc();
        warn!(
            execution_id = %ctx.execution_id,
            task = task.name(),
            attempts = attempted.attempts,
            error = %e,
            "Task failed"
        );
        TaskFailure::from_error(&e, attempted.attempts)
    });

    Invocation {
        outcome,
        attempts: attempted.attempts,
    }
}
