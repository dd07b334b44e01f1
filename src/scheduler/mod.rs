//! Scheduler - daily ingestion trigger
//!
//! On every cron slot, starts one Ingest-Pipeline execution with
//! `trigger = daily` for each ready repository configured for daily
//! ingestion. Starts are keyed by repository and slot, so overlapping
//! schedulers and restarts inside a slot do not double-start.

mod cron;

pub use cron::CronExpr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, TriggerType};
use crate::config::SchedulerConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::storage::StateStore;
use crate::workflows::ingest::{IngestInput, Trigger};
use crate::workflows::IngestPipeline;

/// Idempotency key of a scheduled ingest
pub fn daily_key(repository_id: &str, slot: DateTime<Utc>) -> String {
    format!("daily:{}:{}", repository_id, slot.format("%Y-%m-%dT%H:%MZ"))
}

/// Starts daily ingestion for every eligible repository
pub struct DailyScheduler<S: StateStore + Catalog + Clone> {
    engine: Arc<Engine<S>>,
    cron: CronExpr,
    tick: Duration,
    /// Last slot fully handled
    last_slot: Mutex<Option<DateTime<Utc>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<S: StateStore + Catalog + Clone> DailyScheduler<S> {
    pub fn new(engine: Arc<Engine<S>>, config: &SchedulerConfig) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            engine,
            cron: CronExpr::parse(&config.daily_cron)?,
            tick: Duration::from_secs(config.tick_secs.max(1)),
            last_slot: Mutex::new(None),
            shutdown_tx,
        })
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the scheduler loop until shutdown
    pub async fn run(&self) -> Result<()> {
        info!(schedule = %self.cron, "Starting daily scheduler");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.tick);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check(Utc::now()).await {
                        error!(error = %e, "Error checking daily schedule");
                    }
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Fire the most recent slot at or before `now` unless already handled.
    /// Returns how many executions were newly started.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<usize> {
        let slot = match self.cron.latest_at_or_before(now) {
            Some(slot) => slot,
            None => return Ok(0),
        };

        if *self.last_slot.lock() == Some(slot) {
            return Ok(0);
        }

        let started = self.fire(slot).await?;
        *self.last_slot.lock() = Some(slot);
        Ok(started)
    }

    /// Start daily ingestion for `slot`
    pub async fn fire(&self, slot: DateTime<Utc>) -> Result<usize> {
        let repositories = self.engine.store().list_repositories().await?;
        let mut started = 0;

        for repository in repositories
            .iter()
            .filter(|r| r.is_ready() && r.config.trigger_type == TriggerType::Daily)
        {
            let input = IngestInput {
                repository_id: repository.id.clone(),
                trigger: Trigger::Daily,
                bucket: None,
                prefix: None,
                key: None,
                pipeline_config: None,
            };

            match self
                .engine
                .start::<IngestPipeline>(input, Some(daily_key(&repository.id, slot)))
                .await
            {
                Ok(s) if s.created => {
                    started += 1;
                    info!(
                        repository_id = %repository.id,
                        execution_id = %s.execution_id,
                        slot = %slot,
                        "Scheduled daily ingestion"
                    );
                }
                Ok(_) => debug!(repository_id = %repository.id, "Daily ingestion already started"),
                Err(e) => warn!(repository_id = %repository.id, error = %e, "Failed to schedule ingestion"),
            }
        }

        Ok(started)
    }
}
