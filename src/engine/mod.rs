//! Engine - durable execution of workflow instances
//!
//! The engine is responsible for:
//! - Starting executions (idempotently, keyed by an optional idempotency key)
//! - Polling for due executions and leasing them to this worker
//! - Driving each execution state by state, checkpointing after every
//!   transition while the lease is held
//! - Suspending executions in wait states and resuming them when due
//! - Enforcing execution deadlines

mod invoke;

pub use invoke::{invoke, Invocation};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::concurrency::{ConcurrencyConfig, ConcurrencyManager};
use crate::config::{WorkerConfig, WorkflowSettings};
use crate::error::{FlowError, Result};
use crate::metrics::FlowMetrics;
use crate::models::{Checkpoint, Execution, ExecutionStatus, HistoryEntry, WorkflowKind};
use crate::storage::{StateStore, StateStoreExt};
use crate::tasks::{Collaborators, Services, TaskContext};
use crate::workflows::{
    Context, CreateStore, DeletePipeline, DeleteStore, IngestPipeline, Step, Workflow,
};

/// How often terminal executions past retention are purged
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unique worker ID
    pub worker_id: String,
    /// Poll interval for due executions
    pub poll_interval: Duration,
    /// Number of executions to lease at once
    pub batch_size: i64,
    /// Lease duration in seconds
    pub lock_duration_secs: i64,
    /// Heartbeat interval (should be < lock_duration)
    pub heartbeat_interval: Duration,
    /// Maximum executions driven at once
    pub max_concurrent: usize,
    /// Terminal executions are purged after this many days; 0 keeps them
    pub retention_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        WorkerConfig::default().into()
    }
}

impl From<WorkerConfig> for EngineConfig {
    fn from(c: WorkerConfig) -> Self {
        let poll_interval = c.poll_interval();
        let heartbeat_interval = Duration::from_secs((c.lock_duration_secs.max(3) / 3) as u64);
        Self {
            worker_id: c.worker_id,
            poll_interval,
            batch_size: c.batch_size,
            lock_duration_secs: c.lock_duration_secs,
            heartbeat_interval,
            max_concurrent: c.max_concurrent.max(1),
            retention_days: c.retention_days,
        }
    }
}

/// Result of starting an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Started {
    pub execution_id: Uuid,
    /// False when the idempotency key already named an execution
    pub created: bool,
}

/// How a drive pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Finished(ExecutionStatus),
    Suspended(DateTime<Utc>),
    /// Another worker took over; nothing more was written
    LeaseLost,
}

/// The engine that drives workflow executions
pub struct Engine<S: StateStore + Catalog + Clone> {
    store: S,
    services: Services,
    config: EngineConfig,
    settings: WorkflowSettings,
    shutdown_tx: broadcast::Sender<()>,
    concurrency_semaphore: Arc<Semaphore>,
}

impl<S: StateStore + Catalog + Clone> Engine<S> {
    /// Create an engine with default workflow settings and task limits
    pub fn new(store: S, collaborators: Collaborators, config: EngineConfig) -> Self {
        let services = Services::new(
            Arc::new(store.clone()),
            collaborators,
            Arc::new(ConcurrencyManager::new(ConcurrencyConfig::default())),
            Arc::new(FlowMetrics::new()),
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        let concurrency_semaphore = Arc::new(Semaphore::new(config.max_concurrent));

        Self {
            store,
            services,
            config,
            settings: WorkflowSettings::default(),
            shutdown_tx,
            concurrency_semaphore,
        }
    }

    /// Settings snapshotted into executions started from now on
    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_concurrency(mut self, config: ConcurrencyConfig) -> Self {
        self.services.concurrency = Arc::new(ConcurrencyManager::new(config));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<FlowMetrics>) -> Self {
        self.services.metrics = metrics;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<FlowMetrics> {
        &self.services.metrics
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.services.concurrency
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Get a shutdown handle to stop the engine
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    // =========================================================================
    // Starting executions
    // =========================================================================

    /// Start a workflow instance
    pub async fn start<W: Workflow>(
        &self,
        input: W::Input,
        idempotency_key: Option<String>,
    ) -> Result<Started> {
        let now = Utc::now();
        let settings = self.settings.clone();
        let input_json = serde_json::to_value(&input)?;
        let state = W::initial(input, &Context::new(&settings, now))?;

        let mut execution = Execution::new(
            W::KIND,
            input_json,
            W::state_name(&state),
            serde_json::to_value(&state)?,
            settings.clone(),
        );
        if let Some(timeout) = W::timeout(&settings) {
            execution = execution.with_deadline(now + to_chrono(timeout)?);
        }
        if let Some(key) = idempotency_key {
            execution = execution.with_idempotency_key(key);
        }

        let (execution_id, created) = self.store.insert_idempotent(&execution).await?;
        if created {
            self.services.metrics.executions_started.inc();
            info!(
                execution_id = %execution_id,
                workflow = %W::KIND,
                "Started execution"
            );
        } else {
            debug!(execution_id = %execution_id, "Idempotency key already used");
        }

        Ok(Started {
            execution_id,
            created,
        })
    }

    /// Start a workflow instance from an untyped payload
    pub async fn start_json(
        &self,
        kind: WorkflowKind,
        input: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Started> {
        fn parse<T: serde::de::DeserializeOwned>(input: serde_json::Value) -> Result<T> {
            serde_json::from_value(input).map_err(|e| FlowError::InvalidInput(e.to_string()))
        }

        match kind {
            WorkflowKind::CreateStore => {
                self.start::<CreateStore>(parse(input)?, idempotency_key).await
            }
            WorkflowKind::DeleteStore => {
                self.start::<DeleteStore>(parse(input)?, idempotency_key).await
            }
            WorkflowKind::IngestPipeline => {
                self.start::<IngestPipeline>(parse(input)?, idempotency_key).await
            }
            WorkflowKind::DeletePipeline => {
                self.start::<DeletePipeline>(input, idempotency_key).await
            }
        }
    }

    // =========================================================================
    // Worker loop
    // =========================================================================

    /// Run the engine loop until shutdown
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "Starting engine");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut poll_interval = interval(self.config.poll_interval);
        let mut maintenance = interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Engine received shutdown signal");
                    break;
                }
                _ = poll_interval.tick() => {
                    if let Err(e) = self.poll_and_spawn().await {
                        error!(error = %e, "Error in poll cycle");
                    }
                }
                _ = maintenance.tick() => {
                    if let Err(e) = self.purge_expired().await {
                        warn!(error = %e, "Execution cleanup failed");
                    }
                }
            }
        }

        info!("Engine stopped");
        Ok(())
    }

    /// Lease due executions and spawn a driver for each
    async fn poll_and_spawn(&self) -> Result<()> {
        let available = self.concurrency_semaphore.available_permits();
        if available == 0 {
            debug!("No available permits, skipping poll");
            return Ok(());
        }

        let batch_size = std::cmp::min(available as i64, self.config.batch_size);
        let executions = self
            .store
            .lease_executions(
                &self.config.worker_id,
                batch_size,
                self.config.lock_duration_secs,
            )
            .await?;

        if executions.is_empty() {
            return Ok(());
        }

        debug!(count = executions.len(), "Leased executions");

        for execution in executions {
            let permit = self
                .concurrency_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| FlowError::Internal(e.to_string()))?;
            let driver = self.driver();

            tokio::spawn(async move {
                let _permit = permit;
                let execution_id = execution.id;
                if let Err(e) = driver.drive_leased(execution).await {
                    error!(execution_id = %execution_id, error = %e, "Drive failed");
                }
            });
        }

        Ok(())
    }

    /// Lease and drive every due execution once, waiting for all of them
    pub async fn tick(&self) -> Result<usize> {
        let executions = self
            .store
            .lease_executions(
                &self.config.worker_id,
                self.config.batch_size,
                self.config.lock_duration_secs,
            )
            .await?;
        let count = executions.len();

        let mut set = JoinSet::new();
        for execution in executions {
            let driver = self.driver();
            set.spawn(async move { driver.drive_leased(execution).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Drive failed"),
                Err(e) => error!(error = %e, "Driver task panicked"),
            }
        }

        Ok(count)
    }

    /// Drive one execution until it reaches a terminal status, sleeping
    /// through its waits. Returns the final record.
    pub async fn run_to_completion(&self, id: Uuid) -> Result<Execution> {
        let driver = self.driver();

        loop {
            if let Some(execution) = self
                .store
                .lease_execution(id, &self.config.worker_id, self.config.lock_duration_secs)
                .await?
            {
                driver.drive_leased(execution).await?;
            }

            let execution = self
                .store
                .get_execution(id)
                .await?
                .ok_or(FlowError::ExecutionNotFound { id })?;

            if execution.status.is_terminal() {
                return Ok(execution);
            }

            let pause = match (execution.status, execution.run_after) {
                (ExecutionStatus::Waiting, Some(run_after)) => {
                    (run_after - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                }
                _ => self.config.poll_interval.min(Duration::from_millis(50)),
            };
            tokio::time::sleep(pause).await;
        }
    }

    async fn purge_expired(&self) -> Result<()> {
        if self.config.retention_days <= 0 {
            return Ok(());
        }
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        let removed = self.store.cleanup_old_executions(cutoff).await?;
        if removed > 0 {
            info!(removed = removed, "Purged old executions");
        }
        Ok(())
    }

    fn driver(&self) -> Driver<S> {
        Driver {
            store: self.store.clone(),
            services: self.services.clone(),
            config: self.config.clone(),
        }
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| FlowError::Config(format!("duration out of range: {}", e)))
}

/// Drives leased executions; cheap to clone into spawned tasks
#[derive(Clone)]
struct Driver<S: StateStore + Clone> {
    store: S,
    services: Services,
    config: EngineConfig,
}

impl<S: StateStore + Clone> Driver<S> {
    async fn drive_leased(&self, execution: Execution) -> Result<DriveOutcome> {
        let execution_id = execution.id;
        let span = tracing::info_span!(
            "drive_execution",
            execution_id = %execution_id,
            workflow = %execution.workflow
        );

        async move {
            let (heartbeat_tx, heartbeat_handle) = self.spawn_heartbeat(execution_id);
            self.services.metrics.active_executions.inc();

            let result = match execution.workflow {
                WorkflowKind::CreateStore => self.drive::<CreateStore>(execution).await,
                WorkflowKind::DeleteStore => self.drive::<DeleteStore>(execution).await,
                WorkflowKind::IngestPipeline => self.drive::<IngestPipeline>(execution).await,
                WorkflowKind::DeletePipeline => self.drive::<DeletePipeline>(execution).await,
            };

            self.services.metrics.active_executions.dec();
            let _ = heartbeat_tx.send(());
            let _ = heartbeat_handle.await;

            match &result {
                Ok(DriveOutcome::LeaseLost) => {
                    warn!(execution_id = %execution_id, "Lease lost, abandoning execution")
                }
                Ok(outcome) => debug!(execution_id = %execution_id, outcome = ?outcome, "Drive ended"),
                Err(e) => error!(execution_id = %execution_id, error = %e, "Drive aborted"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Keep the lease alive while the execution is driven
    fn spawn_heartbeat(
        &self,
        execution_id: Uuid,
    ) -> (tokio::sync::oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let store = self.store.clone();
        let worker_id = self.config.worker_id.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let lock_duration = self.config.lock_duration_secs;
        let (heartbeat_tx, mut heartbeat_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut interval = interval(heartbeat_interval);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut heartbeat_rx => break,
                    _ = interval.tick() => {
                        match store.extend_lease(execution_id, &worker_id, lock_duration).await {
                            Ok(true) => debug!(execution_id = %execution_id, "Extended lease"),
                            Ok(false) => break,
                            Err(e) => {
                                warn!(execution_id = %execution_id, error = %e, "Failed to extend lease");
                                break;
                            }
                        }
                    }
                }
            }
        });

        (heartbeat_tx, handle)
    }

    async fn drive<W: Workflow>(&self, execution: Execution) -> Result<DriveOutcome> {
        let id = execution.id;
        let settings = execution.settings.clone();
        let mut transitions = execution.transitions;

        let mut state: W::State = match serde_json::from_value(execution.state.clone()) {
            Ok(state) => state,
            Err(e) => {
                error!(execution_id = %id, error = %e, "Unreadable workflow state");
                return self
                    .finish_failed(&execution, ExecutionStatus::Failed, "States.Runtime", &e.to_string())
                    .await;
            }
        };

        info!(
            execution_id = %id,
            state = W::state_name(&state),
            transitions = transitions,
            "Driving execution"
        );

        loop {
            let now = Utc::now();
            if execution.is_past_deadline(now) {
                return self.time_out(&execution, W::state_name(&state)).await;
            }

            let ctx = Context::new(&settings, now);
            let from = W::state_name(&state);

            match W::step(&state, &ctx) {
                Step::Run(task) => {
                    let task_ctx = TaskContext {
                        execution_id: id,
                        settings: settings.clone(),
                    };
                    let call = invoke(&self.services, &task, &task_ctx);

                    let invocation = match execution.deadline {
                        Some(deadline) => {
                            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
                            match tokio::time::timeout(remaining, call).await {
                                Ok(invocation) => invocation,
                                Err(_) => return self.time_out(&execution, from).await,
                            }
                        }
                        None => call.await,
                    };

                    let detail = invocation.detail();
                    let next = W::transition(state, invocation.outcome, &Context::new(&settings, Utc::now()));
                    if !self
                        .advance::<W>(id, &mut transitions, from, &next, Some(task.name()), Some(detail))
                        .await?
                    {
                        return Ok(DriveOutcome::LeaseLost);
                    }
                    state = next;
                }
                Step::Choice(next) => {
                    if !self
                        .advance::<W>(id, &mut transitions, from, &next, None, None)
                        .await?
                    {
                        return Ok(DriveOutcome::LeaseLost);
                    }
                    state = next;
                }
                Step::Wait { duration, then } => {
                    if duration.is_zero() {
                        if !self
                            .advance::<W>(id, &mut transitions, from, &then, None, None)
                            .await?
                        {
                            return Ok(DriveOutcome::LeaseLost);
                        }
                        state = then;
                        continue;
                    }

                    let run_after = now + to_chrono(duration)?;
                    transitions += 1;
                    let checkpoint = Checkpoint {
                        state_name: W::state_name(&then).to_string(),
                        state: serde_json::to_value(&then)?,
                        transitions,
                    };
                    if !self
                        .store
                        .suspend(id, &self.config.worker_id, &checkpoint, run_after)
                        .await?
                    {
                        return Ok(DriveOutcome::LeaseLost);
                    }
                    self.record(
                        HistoryEntry::new(id, transitions, from, W::state_name(&then))
                            .with_detail(serde_json::json!({ "waitSecs": duration.as_secs_f64() })),
                    )
                    .await;
                    self.services.metrics.transitions.inc();

                    debug!(execution_id = %id, run_after = %run_after, "Execution waiting");
                    return Ok(DriveOutcome::Suspended(run_after));
                }
                Step::Succeed(output) => {
                    if !self
                        .store
                        .complete_execution(id, &self.config.worker_id, &output)
                        .await?
                    {
                        return Ok(DriveOutcome::LeaseLost);
                    }
                    self.services.metrics.executions_succeeded.inc();
                    self.observe_duration(&execution);
                    info!(execution_id = %id, "Execution succeeded");
                    return Ok(DriveOutcome::Finished(ExecutionStatus::Succeeded));
                }
                Step::Fail(failure) => {
                    return self
                        .finish_failed(&execution, ExecutionStatus::Failed, &failure.error, &failure.cause)
                        .await;
                }
            }
        }
    }

    /// Checkpoint a transition and record it; false when the lease was lost
    async fn advance<W: Workflow>(
        &self,
        id: Uuid,
        transitions: &mut i64,
        from: &str,
        next: &W::State,
        task: Option<&str>,
        detail: Option<serde_json::Value>,
    ) -> Result<bool> {
        let sequence = *transitions + 1;
        let checkpoint = Checkpoint {
            state_name: W::state_name(next).to_string(),
            state: serde_json::to_value(next)?,
            transitions: sequence,
        };

        if !self
            .store
            .checkpoint(id, &self.config.worker_id, &checkpoint)
            .await?
        {
            return Ok(false);
        }
        *transitions = sequence;
        self.services.metrics.transitions.inc();

        let mut entry = HistoryEntry::new(id, sequence, from, W::state_name(next));
        if let Some(task) = task {
            entry = entry.with_task(task);
        }
        if let Some(detail) = detail {
            entry = entry.with_detail(detail);
        }
        self.record(entry).await;

        debug!(
            execution_id = %id,
            from = from,
            to = W::state_name(next),
            "Transition"
        );
        Ok(true)
    }

    /// History is best-effort; the checkpoint is the source of truth
    async fn record(&self, entry: HistoryEntry) {
        if let Err(e) = self.store.append_history(&entry).await {
            warn!(execution_id = %entry.execution_id, error = %e, "Failed to append history");
        }
    }

    async fn time_out(&self, execution: &Execution, state_name: &str) -> Result<DriveOutcome> {
        let cause = format!("execution deadline passed in state {}", state_name);
        self.finish_failed(execution, ExecutionStatus::TimedOut, "States.Timeout", &cause)
            .await
    }

    async fn finish_failed(
        &self,
        execution: &Execution,
        status: ExecutionStatus,
        error: &str,
        cause: &str,
    ) -> Result<DriveOutcome> {
        if !self
            .store
            .fail_execution(execution.id, &self.config.worker_id, status, error, cause)
            .await?
        {
            return Ok(DriveOutcome::LeaseLost);
        }

        match status {
            ExecutionStatus::TimedOut => self.services.metrics.executions_timed_out.inc(),
            _ => self.services.metrics.executions_failed.inc(),
        }
        self.observe_duration(execution);
        warn!(
            execution_id = %execution.id,
            status = %status.as_str(),
            error = error,
            cause = cause,
            "Execution failed"
        );
        Ok(DriveOutcome::Finished(status))
    }

    fn observe_duration(&self, execution: &Execution) {
        let elapsed = (Utc::now() - execution.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.services.metrics.execution_duration.observe_duration(elapsed);
    }
}
