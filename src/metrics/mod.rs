//! Metrics - Prometheus compatible export
//!
//! Tracks:
//! - Execution starts and outcomes, transitions, and duration
//! - Task attempts and retries
//! - Fan-out width (in flight and peak)
//! - Documents ingested and removed

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of recent observations kept per histogram for percentiles
const SAMPLE_WINDOW: usize = 1024;

/// Metrics registry
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<Counter>>>,
    gauges: RwLock<BTreeMap<String, Arc<Gauge>>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get or create a counter
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        if let Some(c) = self.counters.read().get(name) {
            return c.clone();
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Counter::default()))
            .clone()
    }

    /// Get or create a gauge
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        if let Some(g) = self.gauges.read().get(name) {
            return g.clone();
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Gauge::default()))
            .clone()
    }

    /// Get or create a histogram with the default second-scale buckets
    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        if let Some(h) = self.histograms.read().get(name) {
            return h.clone();
        }
        self.histograms
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new()))
            .clone()
    }

    /// Export all metrics in Prometheus text format, sorted by name
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        for (name, counter) in self.counters.read().iter() {
            output.push_str(&format!("# TYPE {name} counter\n{name} {}\n", counter.get()));
        }

        for (name, gauge) in self.gauges.read().iter() {
            output.push_str(&format!("# TYPE {name} gauge\n{name} {}\n", gauge.get()));
        }

        for (name, histogram) in self.histograms.read().iter() {
            let snapshot = histogram.snapshot();
            output.push_str(&format!("# TYPE {name} histogram\n"));
            for (le, count) in &snapshot.buckets {
                output.push_str(&format!("{name}_bucket{{le=\"{le}\"}} {count}\n"));
            }
            output.push_str(&format!(
                "{name}_bucket{{le=\"+Inf\"}} {}\n",
                snapshot.count
            ));
            output.push_str(&format!("{name}_sum {}\n", snapshot.sum));
            output.push_str(&format!("{name}_count {}\n", snapshot.count));
        }

        output
    }

    /// Export metrics as JSON
    pub fn export_json(&self) -> serde_json::Value {
        let counters: serde_json::Map<_, _> = self
            .counters
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), serde_json::json!(c.get())))
            .collect();

        let gauges: serde_json::Map<_, _> = self
            .gauges
            .read()
            .iter()
            .map(|(name, g)| (name.clone(), serde_json::json!(g.get())))
            .collect();

        let histograms: serde_json::Map<_, _> = self
            .histograms
            .read()
            .iter()
            .map(|(name, h)| {
                let snapshot = h.snapshot();
                (
                    name.clone(),
                    serde_json::json!({
                        "count": snapshot.count,
                        "sum": snapshot.sum,
                        "mean": snapshot.mean(),
                        "p50": snapshot.percentile(50.0),
                        "p95": snapshot.percentile(95.0),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter - monotonically increasing value
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge - value that can go up or down, never below zero
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Raise to `v` if currently lower
    pub fn set_max(&self, v: u64) {
        self.value.fetch_max(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram - cumulative bucket counts plus a window of recent samples
pub struct Histogram {
    bounds: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum: Mutex<f64>,
    recent: Mutex<VecDeque<f64>>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(vec![
            0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0,
        ])
    }

    pub fn with_buckets(bounds: Vec<f64>) -> Self {
        let bucket_counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            bucket_counts,
            count: AtomicU64::new(0),
            sum: Mutex::new(0.0),
            recent: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
        }
    }

    pub fn observe(&self, value: f64) {
        for (bound, count) in self.bounds.iter().zip(&self.bucket_counts) {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        *self.sum.lock() += value;

        let mut recent = self.recent.lock();
        if recent.len() == SAMPLE_WINDOW {
            recent.pop_front();
        }
        recent.push_back(value);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum: *self.sum.lock(),
            buckets: self
                .bounds
                .iter()
                .zip(&self.bucket_counts)
                .map(|(b, c)| (*b, c.load(Ordering::Relaxed)))
                .collect(),
            recent: self.recent.lock().iter().copied().collect(),
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of histogram state
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub buckets: Vec<(f64, u64)>,
    recent: Vec<f64>,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Percentile over the recent sample window
    pub fn percentile(&self, p: f64) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }

        let mut sorted = self.recent.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let idx = ((p / 100.0) * (sorted.len() as f64 - 1.0)).floor() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

// === Workflow metrics ===

/// Pre-defined metrics for the engine and its tasks
pub struct FlowMetrics {
    pub registry: Arc<MetricsRegistry>,

    // Executions
    pub executions_started: Arc<Counter>,
    pub executions_succeeded: Arc<Counter>,
    pub executions_failed: Arc<Counter>,
    pub executions_timed_out: Arc<Counter>,
    pub transitions: Arc<Counter>,
    pub execution_duration: Arc<Histogram>,
    pub active_executions: Arc<Gauge>,

    // Tasks
    pub task_attempts: Arc<Counter>,
    pub task_retries: Arc<Counter>,
    pub task_failures: Arc<Counter>,

    // Fan-out
    pub fanout_in_flight: Arc<Gauge>,
    pub fanout_peak: Arc<Gauge>,

    // Catalog
    pub documents_ingested: Arc<Counter>,
    pub documents_removed: Arc<Counter>,
}

impl FlowMetrics {
    pub fn new() -> Self {
        let registry = Arc::new(MetricsRegistry::new());

        Self {
            executions_started: registry.counter("kbflow_executions_started_total"),
            executions_succeeded: registry.counter("kbflow_executions_succeeded_total"),
            executions_failed: registry.counter("kbflow_executions_failed_total"),
            executions_timed_out: registry.counter("kbflow_executions_timed_out_total"),
            transitions: registry.counter("kbflow_transitions_total"),
            execution_duration: registry.histogram("kbflow_execution_duration_seconds"),
            active_executions: registry.gauge("kbflow_active_executions"),
            task_attempts: registry.counter("kbflow_task_attempts_total"),
            task_retries: registry.counter("kbflow_task_retries_total"),
            task_failures: registry.counter("kbflow_task_failures_total"),
            fanout_in_flight: registry.gauge("kbflow_fanout_in_flight"),
            fanout_peak: registry.gauge("kbflow_fanout_peak"),
            documents_ingested: registry.counter("kbflow_documents_ingested_total"),
            documents_removed: registry.counter("kbflow_documents_removed_total"),
            registry,
        }
    }

    /// Record the attempts of one task invocation
    pub fn record_attempts(&self, attempts: u32) {
        self.task_attempts.add(attempts as u64);
        self.task_retries.add(attempts.saturating_sub(1) as u64);
    }
}

impl Default for FlowMetrics {
    fn default() -> Self {
        Self::new()
    }
}
