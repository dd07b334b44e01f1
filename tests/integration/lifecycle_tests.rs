//! Repository lifecycle tests: Create-Store, Delete-Store and the daily
//! scheduler, driven end to end against the in-memory store

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use kbflow::catalog::{
    Catalog, Document, ObjectRef, PipelineConfig, Repository, RepositoryConfig, RepositoryKind,
    RepositoryStatus, TriggerType,
};
use kbflow::config::SchedulerConfig;
use kbflow::scheduler::daily_key;
use kbflow::tasks::InfraStatus;
use kbflow::testing::FakeCollaborators;
use kbflow::{
    DailyScheduler, Engine, EngineConfig, ExecutionStatus, MemoryStore, StateStore,
    StateStoreExt, WorkflowKind, WorkflowSettings,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn engine(fakes: &FakeCollaborators) -> Engine<MemoryStore> {
    Engine::new(MemoryStore::new(), fakes.collaborators(), EngineConfig::default())
        .with_settings(WorkflowSettings::without_delays())
}

fn pipeline() -> PipelineConfig {
    PipelineConfig {
        chunk_size: 512,
        chunk_overlap: 64,
        embedding_model: "titan-embed-v2".into(),
        s3_bucket: "source".into(),
        s3_prefix: "docs/".into(),
        collection_name: "default".into(),
    }
}

async fn create(engine: &Engine<MemoryStore>, input: serde_json::Value) -> kbflow::Execution {
    let started = engine
        .start_json(WorkflowKind::CreateStore, input, None)
        .await
        .unwrap();
    engine.run_to_completion(started.execution_id).await.unwrap()
}

async fn ready_repository(store: &MemoryStore, id: &str, trigger: TriggerType) {
    let config = RepositoryConfig {
        trigger_type: trigger,
        pipeline_config: Some(pipeline()),
        ..Default::default()
    };
    let repository = Repository::new(id, RepositoryKind::Opensearch, config)
        .with_status(RepositoryStatus::CreateComplete)
        .with_stack_name(format!("{}-stack", id));
    store.put_repository(&repository).await.unwrap();
}

// =============================================================================
// Create-Store
// =============================================================================

#[tokio::test]
async fn test_create_store_polls_until_provisioned() {
    let fakes = FakeCollaborators::new();
    fakes.provisioner.script([
        InfraStatus::CreateInProgress,
        InfraStatus::CreateInProgress,
        InfraStatus::CreateComplete,
    ]);
    let engine = engine(&fakes);

    let execution = create(
        &engine,
        json!({"repositoryId": "docs", "type": "opensearch"}),
    )
    .await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(
        execution.output,
        Some(json!({
            "repositoryId": "docs",
            "status": "CREATE_COMPLETE",
            "stackName": "docs-stack",
        }))
    );
    assert_eq!(fakes.provisioner.created(), vec!["docs".to_string()]);
    assert_eq!(fakes.provisioner.describe_calls(), 3);
    assert!(fakes.collections.defaults_created().is_empty());

    let repository = engine.store().get_repository("docs").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::CreateComplete);
    assert_eq!(repository.stack_name.as_deref(), Some("docs-stack"));

    let history = engine.store().get_history(execution.id).await.unwrap();
    let waits = history
        .iter()
        .filter(|h| h.to_state == "WaitForProvisioning")
        .count();
    assert_eq!(waits, 2);
    assert_eq!(history.last().unwrap().to_state, "Succeeded");
}

#[tokio::test]
async fn test_create_knowledge_base_gets_default_collection() {
    let fakes = FakeCollaborators::new();
    fakes.provisioner.return_stack(None);
    let engine = engine(&fakes);

    let execution = create(
        &engine,
        json!({
            "repositoryId": "kb",
            "type": "bedrock_knowledge_base",
            "pipelineConfig": {
                "chunkSize": 300,
                "chunkOverlap": 20,
                "embeddingModel": "titan-embed-v2",
                "s3Bucket": "source",
                "s3Prefix": "",
                "collectionName": "default"
            }
        }),
    )
    .await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(fakes.provisioner.describe_calls(), 0);
    assert_eq!(fakes.collections.defaults_created(), vec!["kb".to_string()]);

    let repository = engine.store().get_repository("kb").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::CreateComplete);
    assert_eq!(repository.config.pipeline_config, Some(PipelineConfig {
        chunk_size: 300,
        chunk_overlap: 20,
        ..pipeline()
    }));
}

#[tokio::test]
async fn test_create_knowledge_base_collection_failure_marks_repository_failed() {
    let fakes = FakeCollaborators::new();
    fakes.provisioner.return_stack(None);
    fakes.collections.fail_default_collection("collection quota exceeded");
    let engine = engine(&fakes);

    let execution = create(
        &engine,
        json!({"repositoryId": "kb", "type": "bedrock_knowledge_base"}),
    )
    .await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("Collection.CreateFailed"));
    assert!(fakes.collections.defaults_created().is_empty());

    let repository = engine.store().get_repository("kb").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::CreateFailed);
    assert!(repository
        .status_reason
        .unwrap()
        .contains("collection quota exceeded"));
}

#[tokio::test]
async fn test_create_duplicate_leaves_live_record_alone() {
    let fakes = FakeCollaborators::new();
    let engine = engine(&fakes);
    ready_repository(engine.store(), "docs", TriggerType::Event).await;

    let execution = create(
        &engine,
        json!({"repositoryId": "docs", "type": "pgvector"}),
    )
    .await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("Catalog.ConditionalCheckFailed"));
    assert!(fakes.provisioner.created().is_empty());

    let repository = engine.store().get_repository("docs").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::CreateComplete);
    assert_eq!(repository.kind, RepositoryKind::Opensearch);
}

#[tokio::test]
async fn test_create_failure_marks_repository_failed() {
    let fakes = FakeCollaborators::new();
    fakes
        .provisioner
        .script([InfraStatus::CreateInProgress, InfraStatus::RollbackComplete]);
    let engine = engine(&fakes);

    let execution = create(
        &engine,
        json!({"repositoryId": "docs", "type": "opensearch"}),
    )
    .await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("Provisioning.Failed"));

    let repository = engine.store().get_repository("docs").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::CreateFailed);
    assert!(repository.status_reason.is_some());
}

#[tokio::test]
async fn test_create_can_retry_after_failure() {
    let fakes = FakeCollaborators::new();
    fakes.provisioner.script([InfraStatus::CreateFailed]);
    let engine = engine(&fakes);

    let first = create(&engine, json!({"repositoryId": "docs", "type": "opensearch"})).await;
    assert_eq!(first.status, ExecutionStatus::Failed);

    fakes.provisioner.script([InfraStatus::CreateComplete]);
    let second = create(&engine, json!({"repositoryId": "docs", "type": "opensearch"})).await;
    assert_eq!(second.status, ExecutionStatus::Succeeded);

    let repository = engine.store().get_repository("docs").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::CreateComplete);
    assert_eq!(repository.status_reason, None);
}

#[tokio::test]
async fn test_create_rejected_request_fails() {
    let fakes = FakeCollaborators::new();
    fakes.provisioner.reject_requests("template is invalid");
    let engine = engine(&fakes);

    let execution = create(&engine, json!({"repositoryId": "docs", "type": "opensearch"})).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let repository = engine.store().get_repository("docs").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::CreateFailed);
}

// =============================================================================
// Delete-Store
// =============================================================================

async fn seed_documents(store: &MemoryStore, repository_id: &str, count: usize) {
    for i in 0..count {
        let object = ObjectRef::new("source", format!("docs/{}.pdf", i));
        store
            .upsert_document(&Document::new(repository_id, "default", object))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_delete_store_full_teardown() {
    let fakes = FakeCollaborators::new();
    fakes.collections.report_pending(2);
    fakes
        .provisioner
        .script([InfraStatus::DeleteInProgress, InfraStatus::DeleteComplete]);
    let settings = WorkflowSettings {
        cleanup_page_size: 2,
        ..WorkflowSettings::without_delays()
    };
    let engine = Engine::new(MemoryStore::new(), fakes.collaborators(), EngineConfig::default())
        .with_settings(settings);

    ready_repository(engine.store(), "docs", TriggerType::Event).await;
    seed_documents(engine.store(), "docs", 5).await;
    seed_documents(engine.store(), "other", 1).await;

    let started = engine
        .start_json(WorkflowKind::DeleteStore, json!({"repositoryId": "docs"}), None)
        .await
        .unwrap();
    let execution = engine.run_to_completion(started.execution_id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(
        execution.output,
        Some(json!({
            "repositoryId": "docs",
            "status": "DELETE_COMPLETE",
            "cleanupPages": 3,
            "documentsRemoved": 5,
        }))
    );
    assert_eq!(fakes.collections.deletion_checks(), 3);
    assert_eq!(fakes.provisioner.deleted(), vec!["docs-stack".to_string()]);

    let store = engine.store();
    assert!(store.get_repository("docs").await.unwrap().is_none());
    assert_eq!(store.count_documents("docs").await.unwrap(), 0);
    assert_eq!(store.count_documents("other").await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_store_skip_documents() {
    let fakes = FakeCollaborators::new();
    fakes.provisioner.script([InfraStatus::NotFound]);
    let engine = engine(&fakes);

    ready_repository(engine.store(), "docs", TriggerType::Event).await;
    seed_documents(engine.store(), "docs", 2).await;

    let started = engine
        .start_json(
            WorkflowKind::DeleteStore,
            json!({"repositoryId": "docs", "skipDocumentRemoval": true}),
            None,
        )
        .await
        .unwrap();
    let execution = engine.run_to_completion(started.execution_id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(fakes.collections.deletion_checks(), 0);
    assert_eq!(engine.store().count_documents("docs").await.unwrap(), 2);
    assert!(engine.store().get_repository("docs").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_store_infra_failure_marks_delete_failed() {
    let fakes = FakeCollaborators::new();
    fakes.provisioner.script([InfraStatus::DeleteFailed]);
    let engine = engine(&fakes);
    ready_repository(engine.store(), "docs", TriggerType::Event).await;

    let started = engine
        .start_json(WorkflowKind::DeleteStore, json!({"repositoryId": "docs"}), None)
        .await
        .unwrap();
    let execution = engine.run_to_completion(started.execution_id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("Infrastructure.DeleteFailed"));

    let repository = engine.store().get_repository("docs").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::DeleteFailed);
}

#[tokio::test]
async fn test_delete_store_survives_transient_collection_errors() {
    let fakes = FakeCollaborators::new();
    fakes.collections.fail_deletion_checks(2);
    fakes.provisioner.script([InfraStatus::DeleteComplete]);
    let engine = engine(&fakes);
    ready_repository(engine.store(), "docs", TriggerType::Event).await;

    let started = engine
        .start_json(WorkflowKind::DeleteStore, json!({"repositoryId": "docs"}), None)
        .await
        .unwrap();
    let execution = engine.run_to_completion(started.execution_id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(fakes.collections.deletion_checks(), 3);
}

#[tokio::test]
async fn test_delete_store_with_no_documents_runs_one_cleanup_page() {
    let fakes = FakeCollaborators::new();
    fakes.provisioner.script([InfraStatus::DeleteComplete]);
    let engine = engine(&fakes);
    ready_repository(engine.store(), "docs", TriggerType::Event).await;

    let started = engine
        .start_json(WorkflowKind::DeleteStore, json!({"repositoryId": "docs"}), None)
        .await
        .unwrap();
    let execution = engine.run_to_completion(started.execution_id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    let output = execution.output.unwrap();
    assert_eq!(output["cleanupPages"], json!(1));
    assert_eq!(output["documentsRemoved"], json!(0));
}

#[tokio::test]
async fn test_delete_recovers_failed_create() {
    let fakes = FakeCollaborators::new();
    fakes.provisioner.script([InfraStatus::RollbackComplete]);
    let engine = engine(&fakes);

    let created = create(&engine, json!({"repositoryId": "docs", "type": "opensearch"})).await;
    assert_eq!(created.status, ExecutionStatus::Failed);
    let repository = engine.store().get_repository("docs").await.unwrap().unwrap();
    assert_eq!(repository.status, RepositoryStatus::CreateFailed);
    seed_documents(engine.store(), "docs", 1).await;

    fakes.provisioner.script([InfraStatus::DeleteComplete]);
    let started = engine
        .start_json(WorkflowKind::DeleteStore, json!({"repositoryId": "docs"}), None)
        .await
        .unwrap();
    let execution = engine.run_to_completion(started.execution_id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.output.unwrap()["documentsRemoved"], json!(1));
    assert_eq!(fakes.provisioner.deleted(), vec!["docs-stack".to_string()]);
    assert!(engine.store().get_repository("docs").await.unwrap().is_none());
    assert_eq!(engine.store().count_documents("docs").await.unwrap(), 0);
}

// =============================================================================
// Daily scheduler
// =============================================================================

fn scheduler(engine: Engine<MemoryStore>) -> DailyScheduler<MemoryStore> {
    let config = SchedulerConfig {
        enabled: true,
        daily_cron: "0 3 * * *".into(),
        tick_secs: 60,
    };
    DailyScheduler::new(Arc::new(engine), &config).unwrap()
}

#[tokio::test]
async fn test_scheduler_fires_once_per_slot() {
    let fakes = FakeCollaborators::new();
    let engine = engine(&fakes);
    ready_repository(engine.store(), "daily-repo", TriggerType::Daily).await;
    ready_repository(engine.store(), "event-repo", TriggerType::Event).await;
    let store = engine.store().clone();
    let scheduler = scheduler(engine);

    let now = Utc.with_ymd_and_hms(2024, 1, 15, 3, 10, 0).unwrap();
    assert_eq!(scheduler.check(now).await.unwrap(), 1);
    assert_eq!(scheduler.check(now).await.unwrap(), 0);
    // a second instance firing the same slot is deduplicated by key
    let slot = Utc.with_ymd_and_hms(2024, 1, 15, 3, 0, 0).unwrap();
    assert_eq!(scheduler.fire(slot).await.unwrap(), 0);

    let active = store
        .list_active(Some(WorkflowKind::IngestPipeline), 10)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].input["repositoryId"], json!("daily-repo"));
    assert_eq!(active[0].input["trigger"], json!("daily"));
    assert_eq!(
        active[0].idempotency_key.as_deref(),
        Some(daily_key("daily-repo", slot).as_str())
    );

    let next_day = Utc.with_ymd_and_hms(2024, 1, 16, 3, 0, 0).unwrap();
    assert_eq!(scheduler.check(next_day).await.unwrap(), 1);
}

#[tokio::test]
async fn test_scheduler_skips_repositories_not_ready() {
    let fakes = FakeCollaborators::new();
    let engine = engine(&fakes);
    let config = RepositoryConfig {
        trigger_type: TriggerType::Daily,
        pipeline_config: Some(pipeline()),
        ..Default::default()
    };
    engine
        .store()
        .put_repository(&Repository::new("pending", RepositoryKind::Pgvector, config))
        .await
        .unwrap();
    let scheduler = scheduler(engine);

    let slot = Utc.with_ymd_and_hms(2024, 1, 15, 3, 0, 0).unwrap();
    assert_eq!(scheduler.fire(slot).await.unwrap(), 0);
}
