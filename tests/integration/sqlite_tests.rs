//! SQLite store tests, including restart and resume from a file database

use chrono::{Duration, Utc};
use kbflow::catalog::{
    Catalog, Document, DocumentStatus, ObjectRef, Repository, RepositoryConfig, RepositoryKind,
    RepositoryStatus, SubDocument, TriggerType,
};
use kbflow::models::{Checkpoint, Execution, ExecutionStatus, HistoryEntry, WorkflowKind};
use kbflow::tasks::InfraStatus;
use kbflow::testing::FakeCollaborators;
use kbflow::{
    Engine, EngineConfig, FlowError, SqliteStore, StateStore, StateStoreExt, WorkflowSettings,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn execution(workflow: WorkflowKind) -> Execution {
    Execution::new(
        workflow,
        json!({"repositoryId": "repo-1"}),
        "Start",
        json!({"at": {"state": "start"}}),
        WorkflowSettings::default(),
    )
}

// =============================================================================
// Executions
// =============================================================================

#[tokio::test]
async fn test_roundtrip_preserves_execution() {
    let store = SqliteStore::in_memory().await.unwrap();
    let e = execution(WorkflowKind::IngestPipeline)
        .with_idempotency_key("daily:repo-1:2024-01-15T03:00Z")
        .with_deadline(Utc::now() + Duration::hours(2));
    store.insert_execution(&e).await.unwrap();

    let stored = store.get_execution(e.id).await.unwrap().unwrap();
    assert_eq!(stored.id, e.id);
    assert_eq!(stored.workflow, WorkflowKind::IngestPipeline);
    assert_eq!(stored.status, ExecutionStatus::Queued);
    assert_eq!(stored.input, e.input);
    assert_eq!(stored.state, e.state);
    assert_eq!(stored.settings, e.settings);
    assert_eq!(stored.deadline, e.deadline);
    assert_eq!(stored.idempotency_key, e.idempotency_key);
}

#[tokio::test]
async fn test_idempotent_insert() {
    let store = SqliteStore::in_memory().await.unwrap();
    let first = execution(WorkflowKind::DeletePipeline).with_idempotency_key("evt-1");
    let second = execution(WorkflowKind::DeletePipeline).with_idempotency_key("evt-1");

    let (id1, created1) = store.insert_idempotent(&first).await.unwrap();
    let (id2, created2) = store.insert_idempotent(&second).await.unwrap();

    assert!(created1);
    assert!(!created2);
    assert_eq!(id1, id2);
    assert!(matches!(
        store.insert_execution(&second).await,
        Err(FlowError::Database(_))
    ));
}

#[tokio::test]
async fn test_lease_checkpoint_and_takeover() {
    let store = SqliteStore::in_memory().await.unwrap();
    let e = execution(WorkflowKind::CreateStore);
    store.insert_execution(&e).await.unwrap();

    let leased = store.lease_executions("w1", 10, 60).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert!(store.lease_executions("w2", 10, 60).await.unwrap().is_empty());

    let checkpoint = Checkpoint {
        state_name: "RequestProvisioning".into(),
        state: json!({"at": {"state": "requestProvisioning"}}),
        transitions: 1,
    };
    assert!(store.checkpoint(e.id, "w1", &checkpoint).await.unwrap());
    assert!(!store.checkpoint(e.id, "w2", &checkpoint).await.unwrap());
    assert!(store.extend_lease(e.id, "w1", -1).await.unwrap());

    // w1's lease has lapsed
    let taken = store.lease_execution(e.id, "w2", 60).await.unwrap().unwrap();
    assert_eq!(taken.state_name, "RequestProvisioning");
    assert_eq!(taken.transitions, 1);
    assert!(!store.checkpoint(e.id, "w1", &checkpoint).await.unwrap());
}

#[tokio::test]
async fn test_suspend_and_terminal_states() {
    let store = SqliteStore::in_memory().await.unwrap();
    let e = execution(WorkflowKind::CreateStore);
    store.insert_execution(&e).await.unwrap();
    store.lease_execution(e.id, "w1", 60).await.unwrap().unwrap();

    let checkpoint = Checkpoint {
        state_name: "PollStatus".into(),
        state: json!({}),
        transitions: 3,
    };
    let later = Utc::now() + Duration::seconds(30);
    assert!(store.suspend(e.id, "w1", &checkpoint, later).await.unwrap());

    let waiting = store.get_execution(e.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, ExecutionStatus::Waiting);
    assert_eq!(waiting.locked_by, None);
    assert!(store.lease_executions("w1", 10, 60).await.unwrap().is_empty());
    assert_eq!(store.list_active(None, 10).await.unwrap().len(), 1);

    let due = execution(WorkflowKind::DeletePipeline);
    store.insert_execution(&due).await.unwrap();
    store.lease_execution(due.id, "w1", 60).await.unwrap().unwrap();
    assert!(store
        .fail_execution(due.id, "w1", ExecutionStatus::Failed, "Pipeline.InvalidEvent", "no key")
        .await
        .unwrap());

    let failed = store.get_execution(due.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Pipeline.InvalidEvent"));
    assert!(failed.ended_at.is_some());

    let removed = store
        .cleanup_old_executions(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_execution(e.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_history_dedupes_sequences() {
    let store = SqliteStore::in_memory().await.unwrap();
    let e = execution(WorkflowKind::DeleteStore);
    store.insert_execution(&e).await.unwrap();

    for (seq, from, to) in [
        (1, "MarkDeleteInProgress", "ShouldSkipDocumentCleanup"),
        (2, "ShouldSkipDocumentCleanup", "LoadRepositoryRecord"),
        (2, "ShouldSkipDocumentCleanup", "LoadRepositoryRecord"),
    ] {
        store
            .append_history(&HistoryEntry::new(e.id, seq, from, to))
            .await
            .unwrap();
    }

    let history = store.get_history(e.id).await.unwrap();
    let sequences: Vec<i64> = history.iter().map(|h| h.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
}

// =============================================================================
// Catalog
// =============================================================================

#[tokio::test]
async fn test_repository_conditional_writes() {
    let store = SqliteStore::in_memory().await.unwrap();
    let repository = Repository::new("repo-1", RepositoryKind::Pgvector, RepositoryConfig {
        trigger_type: TriggerType::Daily,
        ..Default::default()
    });
    store.put_repository(&repository).await.unwrap();

    let err = store.put_repository(&repository).await.unwrap_err();
    assert!(matches!(err, FlowError::RepositoryExists { .. }));

    store
        .transition_repository("repo-1", RepositoryStatus::CreateFailed, None, Some("rollback"))
        .await
        .unwrap();
    // a failed create may be replaced
    store.put_repository(&repository).await.unwrap();

    let stored = store.get_repository("repo-1").await.unwrap().unwrap();
    assert_eq!(stored.status, RepositoryStatus::CreateInProgress);
    assert_eq!(stored.config.trigger_type, TriggerType::Daily);

    let err = store
        .transition_repository("repo-1", RepositoryStatus::DeleteComplete, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::StatusConflict { .. }));
}

#[tokio::test]
async fn test_documents_and_cleanup_pages() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut first = None;
    for i in 0..3 {
        let doc = Document::new("repo-1", "default", ObjectRef::new("b", format!("k{}", i)));
        store.upsert_document(&doc).await.unwrap();
        first.get_or_insert(doc);
    }
    let doc = first.unwrap();
    store
        .replace_sub_documents(doc.id, &[SubDocument::new(&doc, 0, "k0#0")])
        .await
        .unwrap();

    let stored = store.get_document(doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Processing);
    assert_eq!(stored.source, doc.source);
    assert_eq!(store.list_sub_documents(doc.id).await.unwrap().len(), 1);

    let page = store.cleanup_documents("repo-1", None, 2).await.unwrap();
    assert_eq!(page.removed, 2);
    let cursor = page.last_evaluated.unwrap();
    let page = store
        .cleanup_documents("repo-1", Some(&cursor), 2)
        .await
        .unwrap();
    assert_eq!(page.removed, 1);
    assert_eq!(page.last_evaluated, None);
    assert_eq!(store.count_documents("repo-1").await.unwrap(), 0);
    assert!(store.list_sub_documents(doc.id).await.unwrap().is_empty());
}

// =============================================================================
// Restart and resume
// =============================================================================

#[tokio::test]
async fn test_execution_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("kbflow.db").display());

    let settings = WorkflowSettings {
        provisioning_poll_interval_secs: 60,
        ..WorkflowSettings::without_delays()
    };

    // first process: provisioning starts, then the execution waits
    let execution_id = {
        let store = SqliteStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();

        let fakes = FakeCollaborators::new();
        fakes.provisioner.script([InfraStatus::CreateInProgress]);
        let engine = Engine::new(store.clone(), fakes.collaborators(), EngineConfig::default())
            .with_settings(settings);

        let started = engine
            .start_json(
                WorkflowKind::CreateStore,
                json!({"repositoryId": "docs", "type": "opensearch"}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(engine.tick().await.unwrap(), 1);

        let waiting = store.get_execution(started.execution_id).await.unwrap().unwrap();
        assert_eq!(waiting.status, ExecutionStatus::Waiting);
        assert_eq!(waiting.state_name, "PollStatus");
        assert_eq!(fakes.provisioner.created(), vec!["docs".to_string()]);

        store.close().await;
        started.execution_id
    };

    // second process: same file, fresh collaborators
    let store = SqliteStore::connect(&url).await.unwrap();
    store.migrate().await.unwrap();

    sqlx::query("UPDATE executions SET run_after = ? WHERE id = ?")
        .bind((Utc::now() - Duration::seconds(1)).to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
        .bind(execution_id.to_string())
        .execute(store.pool())
        .await
        .unwrap();

    let fakes = FakeCollaborators::new();
    fakes.provisioner.script([InfraStatus::CreateComplete]);
    let engine = Engine::new(store.clone(), fakes.collaborators(), EngineConfig::default());

    let finished = engine.run_to_completion(execution_id).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    // provisioning was not requested again
    assert!(fakes.provisioner.created().is_empty());
    assert_eq!(fakes.provisioner.describe_calls(), 1);

    let repository = store.get_repository("docs").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::CreateComplete);

    let history = store.get_history(execution_id).await.unwrap();
    let path: Vec<&str> = history.iter().map(|h| h.to_state.as_str()).collect();
    assert_eq!(
        path,
        vec![
            "RequestProvisioning",
            "PollStatus",
            "WaitForProvisioning",
            "PollStatus",
            "UpdateSuccessStatus",
            "Succeeded",
        ]
    );
}
