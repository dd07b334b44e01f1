//! Storage module tests

use chrono::{Duration, Utc};
use kbflow::catalog::{
    Catalog, Document, DocumentStatus, ObjectRef, Repository, RepositoryConfig, RepositoryKind,
    RepositoryStatus, SubDocument,
};
use kbflow::models::{Checkpoint, Execution, ExecutionStatus, HistoryEntry, WorkflowKind};
use kbflow::storage::{MemoryStore, StateStore, StateStoreExt};
use kbflow::{FlowError, WorkflowSettings};
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

fn checkpoint(state_name: &str, transitions: i64) -> Checkpoint {
    Checkpoint {
        state_name: state_name.to_string(),
        state: json!({"at": state_name}),
        transitions,
    }
}

// =============================================================================
// Executions
// =============================================================================

#[tokio::test]
async fn test_memory_store_new() {
    let store = MemoryStore::new();
    assert!(store.ping().await.is_ok());
    assert!(store.migrate().await.is_ok());
}

#[tokio::test]
async fn test_insert_and_get_execution() {
    let store = MemoryStore::new();
    let e = execution(WorkflowKind::CreateStore);
    store.insert_execution(&e).await.unwrap();

    let stored = store.get_execution(e.id).await.unwrap().unwrap();
    assert_eq!(stored.workflow, WorkflowKind::CreateStore);
    assert_eq!(stored.status, ExecutionStatus::Queued);
    assert_eq!(stored.state_name, "Start");
    assert_eq!(stored.transitions, 0);
}

#[tokio::test]
async fn test_insert_idempotent_returns_existing() {
    let store = MemoryStore::new();
    let first = execution(WorkflowKind::IngestPipeline).with_idempotency_key("daily:repo-1:slot");
    let second = execution(WorkflowKind::IngestPipeline).with_idempotency_key("daily:repo-1:slot");

    let (id1, created1) = store.insert_idempotent(&first).await.unwrap();
    let (id2, created2) = store.insert_idempotent(&second).await.unwrap();

    assert!(created1);
    assert!(!created2);
    assert_eq!(id1, id2);
    assert!(store.get_execution(second.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_key_insert_is_constraint_error() {
    let store = MemoryStore::new();
    let first = execution(WorkflowKind::DeletePipeline).with_idempotency_key("evt-1");
    let second = execution(WorkflowKind::DeletePipeline).with_idempotency_key("evt-1");

    store.insert_execution(&first).await.unwrap();
    assert!(matches!(
        store.insert_execution(&second).await,
        Err(FlowError::Database(_))
    ));
}

#[tokio::test]
async fn test_list_executions_filters_by_workflow() {
    let store = MemoryStore::new();
    store.insert_execution(&execution(WorkflowKind::CreateStore)).await.unwrap();
    store.insert_execution(&execution(WorkflowKind::CreateStore)).await.unwrap();
    store.insert_execution(&execution(WorkflowKind::DeleteStore)).await.unwrap();

    let creates = store
        .list_executions(Some(WorkflowKind::CreateStore), 10, 0)
        .await
        .unwrap();
    assert_eq!(creates.len(), 2);

    let all = store.list_executions(None, 10, 0).await.unwrap();
    assert_eq!(all.len(), 3);
    // newest first
    assert!(all[0].id > all[1].id);

    let paged = store.list_executions(None, 1, 1).await.unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].id, all[1].id);
}

// =============================================================================
// Leases
// =============================================================================

#[tokio::test]
async fn test_lease_marks_running_and_excludes_others() {
    let store = MemoryStore::new();
    let e = execution(WorkflowKind::CreateStore);
    store.insert_execution(&e).await.unwrap();

    let leased = store.lease_executions("w1", 10, 60).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].status, ExecutionStatus::Running);
    assert_eq!(leased[0].locked_by.as_deref(), Some("w1"));
    assert!(leased[0].started_at.is_some());

    assert!(store.lease_executions("w2", 10, 60).await.unwrap().is_empty());
    assert!(store.lease_execution(e.id, "w2", 60).await.unwrap().is_none());
}

#[tokio::test]
async fn test_lease_respects_limit() {
    let store = MemoryStore::new();
    for _ in 0..5 {
        store.insert_execution(&execution(WorkflowKind::DeletePipeline)).await.unwrap();
    }

    assert_eq!(store.lease_executions("w1", 2, 60).await.unwrap().len(), 2);
    assert_eq!(store.lease_executions("w1", 10, 60).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_expired_lease_is_released_to_another_worker() {
    let store = MemoryStore::new();
    let e = execution(WorkflowKind::CreateStore);
    store.insert_execution(&e).await.unwrap();

    // a zero-length lease expires immediately
    store.lease_executions("crashed", 10, -1).await.unwrap();
    let leased = store.lease_executions("w2", 10, 60).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].locked_by.as_deref(), Some("w2"));

    // the crashed worker can no longer write
    assert!(!store
        .checkpoint(e.id, "crashed", &checkpoint("Next", 1))
        .await
        .unwrap());
    assert!(!store.extend_lease(e.id, "crashed", 60).await.unwrap());
}

#[tokio::test]
async fn test_checkpoint_requires_lease() {
    let store = MemoryStore::new();
    let e = execution(WorkflowKind::CreateStore);
    store.insert_execution(&e).await.unwrap();

    assert!(!store.checkpoint(e.id, "w1", &checkpoint("Next", 1)).await.unwrap());

    store.lease_execution(e.id, "w1", 60).await.unwrap().unwrap();
    assert!(store.checkpoint(e.id, "w1", &checkpoint("Next", 1)).await.unwrap());

    let stored = store.get_execution(e.id).await.unwrap().unwrap();
    assert_eq!(stored.state_name, "Next");
    assert_eq!(stored.transitions, 1);
    assert_eq!(stored.state, json!({"at": "Next"}));
}

#[tokio::test]
async fn test_suspend_waits_until_run_after() {
    let store = MemoryStore::new();
    let e = execution(WorkflowKind::CreateStore);
    store.insert_execution(&e).await.unwrap();
    store.lease_execution(e.id, "w1", 60).await.unwrap().unwrap();

    let later = Utc::now() + Duration::seconds(60);
    assert!(store
        .suspend(e.id, "w1", &checkpoint("PollStatus", 3), later)
        .await
        .unwrap());

    let stored = store.get_execution(e.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Waiting);
    assert_eq!(stored.locked_by, None);
    assert_eq!(stored.run_after, Some(later));
    assert!(store.lease_executions("w1", 10, 60).await.unwrap().is_empty());

    let due = execution(WorkflowKind::CreateStore);
    store.insert_execution(&due).await.unwrap();
    store.lease_execution(due.id, "w1", 60).await.unwrap().unwrap();
    store
        .suspend(due.id, "w1", &checkpoint("PollStatus", 1), Utc::now() - Duration::seconds(1))
        .await
        .unwrap();
    let leased = store.lease_executions("w2", 10, 60).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, due.id);
}

#[tokio::test]
async fn test_complete_and_fail_are_terminal() {
    let store = MemoryStore::new();
    let ok = execution(WorkflowKind::DeletePipeline);
    let bad = execution(WorkflowKind::DeletePipeline);
    store.insert_execution(&ok).await.unwrap();
    store.insert_execution(&bad).await.unwrap();
    store.lease_executions("w1", 10, 60).await.unwrap();

    assert!(store
        .complete_execution(ok.id, "w1", &json!({"documentsRemoved": 2}))
        .await
        .unwrap());
    assert!(store
        .fail_execution(bad.id, "w1", ExecutionStatus::TimedOut, "States.Timeout", "deadline")
        .await
        .unwrap());

    let ok = store.get_execution(ok.id).await.unwrap().unwrap();
    assert_eq!(ok.status, ExecutionStatus::Succeeded);
    assert_eq!(ok.output, Some(json!({"documentsRemoved": 2})));
    assert!(ok.ended_at.is_some());

    let bad = store.get_execution(bad.id).await.unwrap().unwrap();
    assert_eq!(bad.status, ExecutionStatus::TimedOut);
    assert_eq!(bad.error.as_deref(), Some("States.Timeout"));
    assert_eq!(bad.cause.as_deref(), Some("deadline"));

    assert!(store.lease_executions("w1", 10, 60).await.unwrap().is_empty());
    assert!(store.list_active(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_release_lease_requeues() {
    let store = MemoryStore::new();
    let e = execution(WorkflowKind::CreateStore);
    store.insert_execution(&e).await.unwrap();
    store.lease_execution(e.id, "w1", 60).await.unwrap().unwrap();

    store.release_lease(e.id, "w1").await.unwrap();
    let stored = store.get_execution(e.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Queued);
    assert!(store.lease_execution(e.id, "w2", 60).await.unwrap().is_some());
}

// =============================================================================
// History & maintenance
// =============================================================================

#[tokio::test]
async fn test_history_is_ordered_and_deduplicated() {
    let store = MemoryStore::new();
    let e = execution(WorkflowKind::CreateStore);
    store.insert_execution(&e).await.unwrap();

    store
        .append_history(&HistoryEntry::new(e.id, 2, "RequestProvisioning", "PollStatus"))
        .await
        .unwrap();
    store
        .append_history(
            &HistoryEntry::new(e.id, 1, "CreateCatalogEntry", "RequestProvisioning")
                .with_task("PutRepository"),
        )
        .await
        .unwrap();
    // replay of sequence 2
    store
        .append_history(&HistoryEntry::new(e.id, 2, "RequestProvisioning", "Other"))
        .await
        .unwrap();

    let history = store.get_history(e.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].sequence, 1);
    assert_eq!(history[0].task.as_deref(), Some("PutRepository"));
    assert_eq!(history[1].to_state, "PollStatus");
}

#[tokio::test]
async fn test_cleanup_old_executions_keeps_active() {
    let store = MemoryStore::new();
    let done = execution(WorkflowKind::DeletePipeline).with_idempotency_key("old");
    let active = execution(WorkflowKind::DeletePipeline);
    store.insert_execution(&done).await.unwrap();
    store.insert_execution(&active).await.unwrap();
    store.lease_execution(done.id, "w1", 60).await.unwrap().unwrap();
    store.complete_execution(done.id, "w1", &json!({})).await.unwrap();

    let removed = store
        .cleanup_old_executions(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_execution(done.id).await.unwrap().is_none());
    assert!(store.get_execution(active.id).await.unwrap().is_some());
    // the key is free again
    assert_eq!(store.find_by_idempotency_key("old").await.unwrap(), None);
}

// =============================================================================
// Catalog
// =============================================================================

fn repository(id: &str) -> Repository {
    Repository::new(id, RepositoryKind::Opensearch, RepositoryConfig::default())
}

#[tokio::test]
async fn test_put_repository_rejects_live_duplicate() {
    let store = MemoryStore::new();
    store.put_repository(&repository("repo-1")).await.unwrap();

    let err = store.put_repository(&repository("repo-1")).await.unwrap_err();
    assert!(err.is_conditional_failure());
    assert!(matches!(
        err,
        FlowError::RepositoryExists {
            status: RepositoryStatus::CreateInProgress,
            ..
        }
    ));
}

#[tokio::test]
async fn test_transition_repository_is_conditional() {
    let store = MemoryStore::new();
    store.put_repository(&repository("repo-1")).await.unwrap();

    let updated = store
        .transition_repository("repo-1", RepositoryStatus::CreateComplete, Some("stack-1"), None)
        .await
        .unwrap();
    assert_eq!(updated.status, RepositoryStatus::CreateComplete);
    assert_eq!(updated.stack_name.as_deref(), Some("stack-1"));

    // a late failure cannot overwrite a completed create
    let err = store
        .transition_repository("repo-1", RepositoryStatus::CreateFailed, None, Some("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::StatusConflict { .. }));

    let missing = store
        .transition_repository("nope", RepositoryStatus::DeleteInProgress, None, None)
        .await
        .unwrap_err();
    assert!(matches!(missing, FlowError::RepositoryNotFound { .. }));
}

#[tokio::test]
async fn test_delete_repository() {
    let store = MemoryStore::new();
    store.put_repository(&repository("repo-1")).await.unwrap();

    assert!(store.delete_repository("repo-1").await.unwrap());
    assert!(!store.delete_repository("repo-1").await.unwrap());
    assert!(store.get_repository("repo-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_documents_and_sub_documents() {
    let store = MemoryStore::new();
    let source = ObjectRef::new("source", "docs/a.pdf");
    let mut doc = Document::new("repo-1", "default", source.clone());
    store.upsert_document(&doc).await.unwrap();

    let chunks = vec![
        SubDocument::new(&doc, 1, "chunk-b"),
        SubDocument::new(&doc, 0, "chunk-a"),
    ];
    store.replace_sub_documents(doc.id, &chunks).await.unwrap();

    doc.status = DocumentStatus::Ingested;
    doc.chunk_count = 2;
    store.upsert_document(&doc).await.unwrap();

    let found = store
        .find_documents_by_source("repo-1", "source", "docs/a.pdf")
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].status, DocumentStatus::Ingested);

    let listed = store.list_sub_documents(doc.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].ordinal, 0);

    assert!(store.delete_document(doc.id).await.unwrap());
    assert!(store.list_sub_documents(doc.id).await.unwrap().is_empty());
    assert_eq!(store.count_documents("repo-1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_document_id_is_stable_per_source() {
    let source = ObjectRef::new("source", "docs/a.pdf");
    assert_eq!(
        Document::id_for("repo-1", "default", &source),
        Document::id_for("repo-1", "default", &source)
    );
    assert_ne!(
        Document::id_for("repo-1", "default", &source),
        Document::id_for("repo-2", "default", &source)
    );
}

#[tokio::test]
async fn test_cleanup_documents_pages_through_repository() {
    let store = MemoryStore::new();
    for i in 0..5 {
        let doc = Document::new("repo-1", "default", ObjectRef::new("b", format!("k{}", i)));
        store.upsert_document(&doc).await.unwrap();
    }
    let other = Document::new("repo-2", "default", ObjectRef::new("b", "k"));
    store.upsert_document(&other).await.unwrap();

    let mut cursor = None;
    let mut pages = 0;
    let mut removed = 0;
    loop {
        let page = store
            .cleanup_documents("repo-1", cursor.as_deref(), 2)
            .await
            .unwrap();
        pages += 1;
        removed += page.removed;
        match page.last_evaluated {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(removed, 5);
    assert_eq!(store.count_documents("repo-2").await.unwrap(), 1);
}
