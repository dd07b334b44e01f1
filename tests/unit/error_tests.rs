//! Error type tests

use kbflow::catalog::RepositoryStatus;
use kbflow::error::{DatabaseError, FlowError};
use kbflow::tasks::{TaskError, TaskFailure};
use std::time::Duration;
use uuid::Uuid;

#[test]
fn test_flow_error_database() {
    let err = FlowError::Database(DatabaseError::Connection("test".to_string()));
    assert_eq!(err.to_string(), "Database error: Connection failed: test");
}

#[test]
fn test_flow_error_execution_not_found() {
    let id = Uuid::now_v7();
    let err = FlowError::ExecutionNotFound { id };
    assert_eq!(err.to_string(), format!("Execution not found: {}", id));
}

#[test]
fn test_flow_error_repository_exists() {
    let err = FlowError::RepositoryExists {
        id: "docs".to_string(),
        status: RepositoryStatus::CreateComplete,
    };
    assert_eq!(err.to_string(), "Repository already exists: docs (CREATE_COMPLETE)");
}

#[test]
fn test_flow_error_status_conflict() {
    let err = FlowError::StatusConflict {
        id: "docs".to_string(),
        from: RepositoryStatus::DeleteComplete,
        to: RepositoryStatus::DeleteInProgress,
    };
    assert!(err.to_string().contains("DELETE_COMPLETE -> DELETE_IN_PROGRESS"));
}

#[test]
fn test_flow_error_from_serde() {
    let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: FlowError = serde_err.into();
    assert!(matches!(err, FlowError::Serialization(_)));
}

#[test]
fn test_conditional_failures_become_named_task_failures() {
    let err = FlowError::RepositoryExists {
        id: "docs".to_string(),
        status: RepositoryStatus::CreateInProgress,
    };
    let task_err: TaskError = err.into();
    let failure = TaskFailure::from_error(&task_err, 1);
    assert!(failure.is_conditional_failure());
}

#[test]
fn test_database_errors_are_transient() {
    let err: TaskError = FlowError::Database(DatabaseError::Connection("reset".into())).into();
    assert!(err.is_retryable());
}

#[test]
fn test_task_error_names() {
    assert_eq!(TaskError::Invocation("bad".into()).name(), "Task.InvocationError");
    assert_eq!(TaskError::Transient("busy".into()).name(), "Task.ServiceError");
    assert_eq!(TaskError::Timeout(Duration::from_secs(1)).name(), "Task.Timeout");
    assert_eq!(
        TaskError::failed("Ingest.EmbeddingFailed", "x").name(),
        "Ingest.EmbeddingFailed"
    );
}

#[test]
fn test_task_error_retryability() {
    assert!(TaskError::Transient("busy".into()).is_retryable());
    assert!(TaskError::Timeout(Duration::from_secs(1)).is_retryable());
    assert!(!TaskError::Invocation("bad".into()).is_retryable());
    assert!(!TaskError::failed("Provisioning.Failed", "x").is_retryable());
}

#[test]
fn test_task_failure_display() {
    let failure = TaskFailure::new("Provisioning.Failed", "ROLLBACK_COMPLETE");
    assert!(failure.to_string().contains("Provisioning.Failed"));
    assert!(failure.to_string().contains("ROLLBACK_COMPLETE"));
}
