//! Per-document ingest and delete tasks, and the bounded fan-out over them

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::retry::{with_retry, Attempted};
use super::{FileOutcome, IndexRequest, Services, TaskContext, TaskError};
use crate::catalog::{Document, DocumentStatus, ObjectRef, PipelineConfig, SubDocument};

/// Upper bound on indexing rounds for one document
pub const MAX_CONTINUATIONS: usize = 1000;

/// Ingest every file with at most `FANOUT_LIMIT` in flight.
///
/// Items are retried independently. Siblings of a failed item are never
/// cancelled or rolled back; the whole call fails after all items settle if
/// any item exhausted its retries.
pub async fn process_files(
    services: &Services,
    ctx: &TaskContext,
    repository_id: &str,
    pipeline: &PipelineConfig,
    files: &[ObjectRef],
) -> Result<Vec<FileOutcome>, TaskError> {
    if files.is_empty() {
        return Ok(vec![]);
    }

    let key = ctx.execution_id.to_string();
    info!(
        execution_id = %ctx.execution_id,
        files = files.len(),
        width = services.concurrency.key_limit(),
        "Fanning out ingest"
    );

    let mut set = JoinSet::new();
    for (index, file) in files.iter().cloned().enumerate() {
        let services = services.clone();
        let ctx = ctx.clone();
        let key = key.clone();
        let repository_id = repository_id.to_string();
        let pipeline = pipeline.clone();

        set.spawn(async move {
            // the slot is held across retries of the same item
            let _permit = match services.concurrency.acquire_fanout(&key).await {
                Ok(permit) => permit,
                Err(e) => {
                    let attempted = Attempted {
                        result: Err(TaskError::from(e)),
                        attempts: 0,
                    };
                    return (index, file.key, attempted);
                }
            };

            services.metrics.fanout_in_flight.inc();
            let (s, r, p, f) = (&services, &repository_id, &pipeline, &file);
            let attempted = with_retry(
                &ctx.settings.retry,
                Some(ctx.settings.task_timeout()),
                move |_| ingest_file(s, r, p, f),
            )
            .await;
            services.metrics.fanout_in_flight.dec();

            (index, file.key, attempted)
        });
    }

    let mut outcomes: Vec<(usize, FileOutcome)> = Vec::with_capacity(files.len());
    let mut failures: Vec<(String, TaskError)> = Vec::new();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, _, Attempted { result: Ok(outcome), attempts })) => {
                services.metrics.task_attempts.add(attempts as u64);
                outcomes.push((index, outcome));
            }
            Ok((_, key, Attempted { result: Err(e), attempts })) => {
                services.metrics.task_attempts.add(attempts as u64);
                warn!(key = %key, attempts = attempts, error = %e, "File ingestion failed");
                failures.push((key, e));
            }
            Err(join_error) => {
                failures.push((
                    "<unknown>".to_string(),
                    TaskError::failed("Task.Failed", join_error.to_string()),
                ));
            }
        }
    }

    services.concurrency.release_key(&key);
    services
        .metrics
        .fanout_peak
        .set(services.concurrency.metrics().peak as u64);

    if let Some((_, first)) = failures.first() {
        let cause = failures
            .iter()
            .map(|(key, e)| format!("{}: {}", key, e.cause()))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(TaskError::failed(
            first.name().to_string(),
            format!("{} of {} files failed: {}", failures.len(), files.len(), cause),
        ));
    }

    outcomes.sort_by_key(|(index, _)| *index);
    Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
}

/// Index one file, following continuations, and record it in the catalog
pub async fn ingest_file(
    services: &Services,
    repository_id: &str,
    pipeline: &PipelineConfig,
    file: &ObjectRef,
) -> Result<FileOutcome, TaskError> {
    let collection = &pipeline.collection_name;
    let id = Document::id_for(repository_id, collection, file);

    let mut document = match services.catalog.get_document(id).await? {
        Some(existing) => existing,
        None => Document::new(repository_id, collection, file.clone()),
    };
    document.source = file.clone();
    document.status = DocumentStatus::Processing;
    document.error = None;
    document.updated_at = Utc::now();
    services.catalog.upsert_document(&document).await?;

    let chunks = match index_rounds(services, repository_id, pipeline, &document).await {
        Ok(chunks) => chunks,
        Err(e) => {
            document.status = DocumentStatus::Failed;
            document.error = Some(e.to_string());
            document.updated_at = Utc::now();
            if let Err(record_err) = services.catalog.upsert_document(&document).await {
                warn!(document_id = %document.id, error = %record_err, "Failed to record document failure");
            }
            return Err(e);
        }
    };

    let sub_documents: Vec<SubDocument> = chunks
        .iter()
        .enumerate()
        .map(|(ordinal, chunk_ref)| SubDocument::new(&document, ordinal as u32, chunk_ref.clone()))
        .collect();
    services
        .catalog
        .replace_sub_documents(document.id, &sub_documents)
        .await?;

    document.status = DocumentStatus::Ingested;
    document.chunk_count = sub_documents.len() as u32;
    document.updated_at = Utc::now();
    services.catalog.upsert_document(&document).await?;
    services.metrics.documents_ingested.inc();

    debug!(document_id = %document.id, chunks = document.chunk_count, "Ingested document");

    Ok(FileOutcome {
        document_id: document.id,
        bucket: file.bucket.clone(),
        key: file.key.clone(),
        status: document.status,
        chunks: document.chunk_count,
    })
}

async fn index_rounds(
    services: &Services,
    repository_id: &str,
    pipeline: &PipelineConfig,
    document: &Document,
) -> Result<Vec<String>, TaskError> {
    let mut chunks = Vec::new();
    let mut continuation = None;

    for _ in 0..MAX_CONTINUATIONS {
        let request = IndexRequest {
            repository_id: repository_id.to_string(),
            collection: document.collection.clone(),
            document_id: document.id,
            source: document.source.clone(),
            pipeline: pipeline.clone(),
            continuation: continuation.take(),
        };

        let indexed = services.collaborators.indexer.index(&request).await?;
        chunks.extend(indexed.chunks);

        match indexed.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(chunks),
        }
    }

    Err(TaskError::failed(
        "Ingest.ContinuationLimit",
        format!("document {} still incomplete after {} rounds", document.id, MAX_CONTINUATIONS),
    ))
}

/// Remove every document of the repository sourced from `object`, index
/// first, then catalog. Returns how many were removed.
pub async fn delete_documents(
    services: &Services,
    repository_id: &str,
    object: &ObjectRef,
) -> Result<usize, TaskError> {
    let documents = services
        .catalog
        .find_documents_by_source(repository_id, &object.bucket, &object.key)
        .await?;

    if documents.is_empty() {
        info!(repository_id = %repository_id, key = %object.key, "No documents for deleted object");
        return Ok(0);
    }

    for document in &documents {
        let _permit = services.concurrency.acquire(None).await?;
        services.collaborators.indexer.remove(document).await?;
        services.catalog.delete_document(document.id).await?;
        services.metrics.documents_removed.inc();
    }

    Ok(documents.len())
}
