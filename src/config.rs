//! Configuration for kbflow

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::concurrency::ConcurrencyConfig;
use crate::models::RetryConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub workflows: WorkflowSettings,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("KBFLOW").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: String,
    },
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::sqlite(default_sqlite_path())
    }
}

impl DatabaseConfig {
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self::Sqlite { path: path.into() }
    }

    pub fn in_memory() -> Self {
        Self::Sqlite {
            path: ":memory:".to_string(),
        }
    }

    /// Connection URL; file databases are created on first use
    pub fn url(&self) -> String {
        match self {
            Self::Sqlite { path } if path == ":memory:" => "sqlite::memory:".to_string(),
            Self::Sqlite { path } if path.starts_with("sqlite:") => path.clone(),
            Self::Sqlite { path } => format!("sqlite://{}?mode=rwc", path),
        }
    }
}

fn default_sqlite_path() -> String {
    "kbflow.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_lock_duration")]
    pub lock_duration_secs: i64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Terminal executions older than this are purged; 0 keeps them forever
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
            lock_duration_secs: default_lock_duration(),
            max_concurrent: default_max_concurrent(),
            retention_days: default_retention_days(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::now_v7())
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_batch_size() -> i64 {
    10
}
fn default_lock_duration() -> i64 {
    300
}
fn default_max_concurrent() -> usize {
    10
}
fn default_retention_days() -> i64 {
    30
}

/// Per-workflow tunables, snapshotted into every execution at start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub provisioning_poll_interval_secs: u64,
    pub max_provisioning_polls: u32,
    pub deletion_poll_interval_secs: u64,
    pub max_deletion_polls: u32,
    pub collection_poll_interval_secs: u64,
    pub max_collection_polls: u32,
    /// Documents removed per cleanup call
    pub cleanup_page_size: usize,
    /// Budget for the whole document cleanup loop
    pub cleanup_timeout_secs: u64,
    pub ingest_timeout_secs: u64,
    /// Window for daily ingestion
    pub lookback_hours: i64,
    /// Budget for one task attempt
    pub task_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            provisioning_poll_interval_secs: 30,
            max_provisioning_polls: 240,
            deletion_poll_interval_secs: 10,
            max_deletion_polls: 360,
            collection_poll_interval_secs: 10,
            max_collection_polls: 360,
            cleanup_page_size: 100,
            cleanup_timeout_secs: 4 * 60 * 60,
            ingest_timeout_secs: 2 * 60 * 60,
            lookback_hours: 24,
            task_timeout_secs: 900,
            retry: RetryConfig::default(),
        }
    }
}

impl WorkflowSettings {
    pub fn provisioning_poll_interval(&self) -> Duration {
        Duration::from_secs(self.provisioning_poll_interval_secs)
    }

    pub fn deletion_poll_interval(&self) -> Duration {
        Duration::from_secs(self.deletion_poll_interval_secs)
    }

    pub fn collection_poll_interval(&self) -> Duration {
        Duration::from_secs(self.collection_poll_interval_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Zero-delay polling for tests and local runs
    pub fn without_delays() -> Self {
        Self {
            provisioning_poll_interval_secs: 0,
            deletion_poll_interval_secs: 0,
            collection_poll_interval_secs: 0,
            retry: RetryConfig::immediate(3),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Cron expression for the daily ingestion trigger
    #[serde(default = "default_daily_cron")]
    pub daily_cron: String,
    #[serde(default = "default_scheduler_tick")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            daily_cron: default_daily_cron(),
            tick_secs: default_scheduler_tick(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}
fn default_daily_cron() -> String {
    "0 3 * * *".to_string()
}
fn default_scheduler_tick() -> u64 {
    30
}

/// Remote collaborator endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_tasks_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_tasks_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            endpoint: default_tasks_endpoint(),
            request_timeout_secs: default_tasks_timeout(),
        }
    }
}

impl TasksConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_tasks_endpoint() -> String {
    "http://127.0.0.1:9000".to_string()
}
fn default_tasks_timeout() -> u64 {
    60
}
