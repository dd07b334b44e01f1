//! Concurrency Manager - bounded invocation of document tasks
//!
//! Two limits apply to every per-document invocation:
//! - a global limit shared by all executions, protecting the embedding and
//!   indexing endpoints
//! - a per-key limit (the fan-out width), keyed by execution id

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Hard ceiling on concurrent per-document tasks within one fan-out
pub const FANOUT_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum concurrent document tasks across all executions
    pub global_limit: usize,
    /// Maximum concurrent document tasks per key, capped at `FANOUT_LIMIT`
    pub key_limit: usize,
    /// How long to wait for a global slot
    pub queue_timeout_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_limit: 50,
            key_limit: FANOUT_LIMIT,
            queue_timeout_secs: 3600,
        }
    }
}

impl ConcurrencyConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

pub struct ConcurrencyManager {
    config: ConcurrencyConfig,
    global_semaphore: Arc<Semaphore>,
    key_semaphores: Arc<DashMap<String, Arc<Semaphore>>>,
    key_active: Arc<DashMap<String, KeyCounters>>,
    metrics: Arc<ConcurrencyMetrics>,
}

#[derive(Default)]
struct KeyCounters {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Default)]
pub struct ConcurrencyMetrics {
    pub acquisitions: AtomicU64,
    pub releases: AtomicU64,
    pub timeouts: AtomicU64,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ConcurrencyMetrics {
    pub fn snapshot(&self) -> ConcurrencySnapshot {
        ConcurrencySnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencySnapshot {
    pub acquisitions: u64,
    pub releases: u64,
    pub timeouts: u64,
    pub active: usize,
    pub peak: usize,
}

/// Held for the duration of one document task
pub struct ConcurrencyPermit {
    _global_permit: OwnedSemaphorePermit,
    _key_permit: Option<OwnedSemaphorePermit>,
    key: Option<String>,
    key_active: Arc<DashMap<String, KeyCounters>>,
    metrics: Arc<ConcurrencyMetrics>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if let Some(key) = &self.key {
            if let Some(counters) = self.key_active.get(key) {
                decrement_active(&counters.active);
            }
        }
        decrement_active(&self.metrics.active);
        self.metrics.releases.fetch_add(1, Ordering::Relaxed);
        debug!(key = ?self.key, "Released concurrency permit");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("Timeout waiting for permit after {0:?}")]
    Timeout(Duration),

    #[error("Concurrency limiter closed")]
    Closed,
}

impl ConcurrencyManager {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            global_semaphore: Arc::new(Semaphore::new(config.global_limit.max(1))),
            key_semaphores: Arc::new(DashMap::new()),
            key_active: Arc::new(DashMap::new()),
            metrics: Arc::new(ConcurrencyMetrics::default()),
            config,
        }
    }

    /// Effective per-key width
    pub fn key_limit(&self) -> usize {
        self.config.key_limit.clamp(1, FANOUT_LIMIT)
    }

    pub async fn acquire(&self, key: Option<&str>) -> Result<ConcurrencyPermit, ConcurrencyError> {
        self.acquire_with_timeout(key, self.config.queue_timeout())
            .await
    }

    /// Acquire the key slot first, then the global slot, so a fan-out never
    /// holds more global permits than its own width.
    pub async fn acquire_with_timeout(
        &self,
        key: Option<&str>,
        timeout: Duration,
    ) -> Result<ConcurrencyPermit, ConcurrencyError> {
        let key_permit = match key {
            Some(k) => {
                let sem = self.key_semaphore(k);
                Some(self.wait(sem, timeout).await?)
            }
            None => None,
        };

        let global_permit = self.wait(self.global_semaphore.clone(), timeout).await?;

        Ok(self.grant(global_permit, key, key_permit))
    }

    /// Slot for one item of a fan-out keyed by `key`.
    ///
    /// The key slot is waited on without a timer; the execution deadline
    /// bounds the fan-out. The global slot keeps the queue timeout.
    pub async fn acquire_fanout(&self, key: &str) -> Result<ConcurrencyPermit, ConcurrencyError> {
        let key_permit = self
            .key_semaphore(key)
            .acquire_owned()
            .await
            .map_err(|_| ConcurrencyError::Closed)?;
        let global_permit = self
            .wait(self.global_semaphore.clone(), self.config.queue_timeout())
            .await?;

        Ok(self.grant(global_permit, Some(key), Some(key_permit)))
    }

    /// Acquire without waiting, `None` when either limit is saturated
    pub fn try_acquire(&self, key: Option<&str>) -> Option<ConcurrencyPermit> {
        let key_permit = match key {
            Some(k) => Some(self.key_semaphore(k).try_acquire_owned().ok()?),
            None => None,
        };
        let global_permit = self.global_semaphore.clone().try_acquire_owned().ok()?;
        Some(self.grant(global_permit, key, key_permit))
    }

    pub fn metrics(&self) -> ConcurrencySnapshot {
        self.metrics.snapshot()
    }

    pub fn available_permits(&self) -> usize {
        self.global_semaphore.available_permits()
    }

    pub fn key_active_count(&self, key: &str) -> usize {
        self.key_active
            .get(key)
            .map(|c| c.active.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Highest number of simultaneously held permits for `key`
    pub fn key_peak(&self, key: &str) -> usize {
        self.key_active
            .get(key)
            .map(|c| c.peak.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Forget a key once its fan-out has settled
    pub fn release_key(&self, key: &str) {
        if self.key_active_count(key) == 0 {
            self.key_semaphores.remove(key);
            self.key_active.remove(key);
        }
    }

    fn key_semaphore(&self, key: &str) -> Arc<Semaphore> {
        let limit = self.key_limit();
        self.key_semaphores
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone()
    }

    async fn wait(
        &self,
        sem: Arc<Semaphore>,
        timeout: Duration,
    ) -> Result<OwnedSemaphorePermit, ConcurrencyError> {
        match tokio::time::timeout(timeout, sem.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ConcurrencyError::Closed),
            Err(_) => {
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(ConcurrencyError::Timeout(timeout))
            }
        }
    }

    fn grant(
        &self,
        global_permit: OwnedSemaphorePermit,
        key: Option<&str>,
        key_permit: Option<OwnedSemaphorePermit>,
    ) -> ConcurrencyPermit {
        if let Some(k) = key {
            let counters = self.key_active.entry(k.to_string()).or_default();
            let active = counters.active.fetch_add(1, Ordering::Relaxed) + 1;
            update_peak(&counters.peak, active);
        }

        self.metrics.acquisitions.fetch_add(1, Ordering::Relaxed);
        let active = self.metrics.active.fetch_add(1, Ordering::Relaxed) + 1;
        update_peak(&self.metrics.peak, active);

        ConcurrencyPermit {
            _global_permit: global_permit,
            _key_permit: key_permit,
            key: key.map(str::to_string),
            key_active: self.key_active.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

fn update_peak(peak: &AtomicUsize, active: usize) {
    let mut current_peak = peak.load(Ordering::Relaxed);
    while active > current_peak {
        match peak.compare_exchange_weak(
            current_peak,
            active,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(next_peak) => current_peak = next_peak,
        }
    }
}

fn decrement_active(active: &AtomicUsize) {
    let mut current = active.load(Ordering::Relaxed);
    while current > 0 {
        match active.compare_exchange_weak(
            current,
            current - 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}
