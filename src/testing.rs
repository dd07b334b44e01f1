//! In-process collaborators for tests and local runs
//!
//! Each fake records what it was asked to do and can be scripted to fail,
//! so workflows can be driven end to end without a task service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{Document, ObjectRef, Repository};
use crate::tasks::{
    Collaborators, CollectionManager, DocumentIndexer, IndexRequest, IndexedDocument,
    InfraProvisioner, InfraStatus, ObjectSource, TaskError,
};

/// All four collaborators, with handles kept for assertions
#[derive(Clone, Default)]
pub struct FakeCollaborators {
    pub provisioner: Arc<ScriptedProvisioner>,
    pub collections: Arc<FakeCollections>,
    pub indexer: Arc<RecordingIndexer>,
    pub objects: Arc<StaticObjectSource>,
}

impl FakeCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provisioner: self.provisioner.clone(),
            collections: self.collections.clone(),
            indexer: self.indexer.clone(),
            objects: self.objects.clone(),
        }
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Replays a script of describe results; the last one repeats
#[derive(Default)]
pub struct ScriptedProvisioner {
    statuses: Mutex<VecDeque<InfraStatus>>,
    stack_name: Mutex<Option<Option<String>>>,
    rejection: Mutex<Option<String>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    describes: AtomicUsize,
}

impl ScriptedProvisioner {
    /// Statuses returned by successive describe calls
    pub fn script(&self, statuses: impl IntoIterator<Item = InfraStatus>) {
        *self.statuses.lock() = statuses.into_iter().collect();
    }

    /// Stack returned by create requests; `None` means nothing to poll.
    /// Unset, the stack is named after the repository.
    pub fn return_stack(&self, stack_name: Option<&str>) {
        *self.stack_name.lock() = Some(stack_name.map(str::to_string));
    }

    /// Reject every create or delete request as malformed
    pub fn reject_requests(&self, message: &str) {
        *self.rejection.lock() = Some(message.to_string());
    }

    /// Repository ids create was requested for
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    /// Stacks deletion was requested for
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn describe_calls(&self) -> usize {
        self.describes.load(Ordering::SeqCst)
    }

    fn check_rejection(&self) -> Result<(), TaskError> {
        match self.rejection.lock().as_ref() {
            Some(message) => Err(TaskError::Invocation(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InfraProvisioner for ScriptedProvisioner {
    async fn request_create(&self, repository: &Repository) -> Result<Option<String>, TaskError> {
        self.check_rejection()?;
        self.created.lock().push(repository.id.clone());
        let stack_name = match self.stack_name.lock().clone() {
            Some(scripted) => scripted,
            None => Some(format!("{}-stack", repository.id)),
        };
        Ok(stack_name)
    }

    async fn describe(&self, _stack_name: &str) -> Result<InfraStatus, TaskError> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        Ok(status.unwrap_or(InfraStatus::CreateComplete))
    }

    async fn request_delete(&self, stack_name: &str) -> Result<(), TaskError> {
        self.check_rejection()?;
        self.deleted.lock().push(stack_name.to_string());
        Ok(())
    }
}

// =============================================================================
// Collections
// =============================================================================

#[derive(Default)]
pub struct FakeCollections {
    pending_deletion_failures: AtomicUsize,
    pending_not_deleted: AtomicUsize,
    default_collection_error: Mutex<Option<String>>,
    defaults_created: Mutex<Vec<String>>,
    deletion_checks: AtomicUsize,
}

impl FakeCollections {
    /// The next `n` deletion checks fail with a transient error
    pub fn fail_deletion_checks(&self, n: usize) {
        self.pending_deletion_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` deletion checks report collections still present
    pub fn report_pending(&self, n: usize) {
        self.pending_not_deleted.store(n, Ordering::SeqCst);
    }

    /// Default collection creation fails with a non-retryable error
    pub fn fail_default_collection(&self, message: &str) {
        *self.default_collection_error.lock() = Some(message.to_string());
    }

    /// Repository ids a default collection was created for
    pub fn defaults_created(&self) -> Vec<String> {
        self.defaults_created.lock().clone()
    }

    pub fn deletion_checks(&self) -> usize {
        self.deletion_checks.load(Ordering::SeqCst)
    }
}

/// Decrement if positive; true when a unit was taken
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl CollectionManager for FakeCollections {
    async fn create_default_collection(&self, repository: &Repository) -> Result<(), TaskError> {
        if let Some(message) = self.default_collection_error.lock().as_ref() {
            return Err(TaskError::failed("Collection.CreateFailed", message.clone()));
        }
        self.defaults_created.lock().push(repository.id.clone());
        Ok(())
    }

    async fn collections_deleted(&self, _repository_id: &str) -> Result<bool, TaskError> {
        self.deletion_checks.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.pending_deletion_failures) {
            return Err(TaskError::Transient("collection service unavailable".into()));
        }
        Ok(!take_one(&self.pending_not_deleted))
    }
}

// =============================================================================
// Indexer
// =============================================================================

/// Produces one chunk per round and tracks concurrency
#[derive(Default)]
pub struct RecordingIndexer {
    delay: Mutex<Duration>,
    failing_keys: Mutex<HashSet<String>>,
    transient_failures: Mutex<HashMap<String, usize>>,
    rounds_per_document: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    index_calls: AtomicUsize,
    indexed: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl RecordingIndexer {
    /// Hold each index call for `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Every index call for `key` fails permanently
    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().insert(key.to_string());
    }

    /// The first `n` index calls for `key` fail transiently
    pub fn fail_key_transiently(&self, key: &str, n: usize) {
        self.transient_failures.lock().insert(key.to_string(), n);
    }

    /// Documents need this many rounds, continuing between them
    pub fn set_rounds(&self, rounds: usize) {
        self.rounds_per_document.store(rounds, Ordering::SeqCst);
    }

    /// Highest number of index calls seen at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn index_calls(&self) -> usize {
        self.index_calls.load(Ordering::SeqCst)
    }

    /// Keys whose final round completed
    pub fn indexed(&self) -> Vec<String> {
        self.indexed.lock().clone()
    }

    /// Keys of documents removed from the index
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    fn take_transient(&self, key: &str) -> bool {
        let mut failures = self.transient_failures.lock();
        match failures.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl DocumentIndexer for RecordingIndexer {
    async fn index(&self, request: &IndexRequest) -> Result<IndexedDocument, TaskError> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let key = &request.source.key;
        if self.failing_keys.lock().contains(key) {
            return Err(TaskError::failed("Ingest.EmbeddingFailed", format!("cannot embed {}", key)));
        }
        if self.take_transient(key) {
            return Err(TaskError::Transient(format!("throttled on {}", key)));
        }

        let round = request
            .continuation
            .as_deref()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let rounds = self.rounds_per_document.load(Ordering::SeqCst).max(1);
        let continuation = (round + 1 < rounds).then(|| (round + 1).to_string());
        if continuation.is_none() {
            self.indexed.lock().push(key.clone());
        }

        Ok(IndexedDocument {
            chunks: vec![format!("{}#{}", key, round)],
            continuation,
        })
    }

    async fn remove(&self, document: &Document) -> Result<(), TaskError> {
        self.removed.lock().push(document.source.key.clone());
        Ok(())
    }
}

// =============================================================================
// Object source
// =============================================================================

/// A fixed listing, filtered by bucket, prefix and modification time
#[derive(Default)]
pub struct StaticObjectSource {
    objects: Mutex<Vec<ObjectRef>>,
    listings: AtomicUsize,
}

impl StaticObjectSource {
    pub fn put(&self, bucket: &str, key: &str, last_modified: DateTime<Utc>) {
        let mut object = ObjectRef::new(bucket, key);
        object.last_modified = Some(last_modified);
        self.objects.lock().push(object);
    }

    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectSource for StaticObjectSource {
    async fn list_modified(
        &self,
        bucket: &str,
        prefix: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ObjectRef>, TaskError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|o| o.bucket == bucket && o.key.starts_with(prefix))
            .filter(|o| o.last_modified.map(|m| m >= since).unwrap_or(true))
            .cloned()
            .collect())
    }
}
