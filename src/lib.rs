//! # kbflow
//!
//! Durable workflow orchestration for vector-store backed knowledge
//! repositories.
//!
//! kbflow drives four long-running workflows as explicit state machines:
//! - **Create-Store**: record a repository, provision its backing store,
//!   poll until ready, create its default collection
//! - **Delete-Store**: wait for collections to go, page out document
//!   records, tear down infrastructure, remove the catalog entry
//! - **Ingest-Pipeline**: collect modified objects (daily) or one object
//!   (event) and ingest them with bounded fan-out
//! - **Delete-Pipeline**: remove the documents of a deleted source object
//!
//! Every transition is checkpointed, so an execution resumes where it
//! stopped after a crash or restart. Waits suspend the execution instead
//! of holding a worker.
//!
//! ## Quick Start
//!
//! ```ignore
//! use kbflow::{Engine, EngineConfig, SqliteStore, StateStore};
//! use kbflow::tasks::{Collaborators, HttpTasks};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::connect("sqlite://kbflow.db?mode=rwc").await?;
//!     store.migrate().await?;
//!
//!     let tasks = Arc::new(HttpTasks::new(&Default::default())?);
//!     let engine = Engine::new(store, Collaborators::remote(tasks), EngineConfig::default());
//!
//!     engine
//!         .start_json(
//!             kbflow::WorkflowKind::DeletePipeline,
//!             serde_json::json!({"repositoryId": "docs", "bucket": "src", "key": "a.pdf"}),
//!             None,
//!         )
//!         .await?;
//!
//!     engine.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod catalog;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod tasks;
pub mod workflows;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports for convenience
pub use catalog::{
    Catalog, Document, DocumentStatus, ObjectRef, PipelineConfig, Repository, RepositoryKind,
    RepositoryStatus,
};
pub use concurrency::{ConcurrencyConfig, ConcurrencyManager, FANOUT_LIMIT};
pub use config::{Config, DatabaseConfig, WorkerConfig, WorkflowSettings};
pub use engine::{Engine, EngineConfig, Started};
pub use error::{FlowError, Result};
pub use metrics::{FlowMetrics, MetricsRegistry};
pub use models::{Execution, ExecutionStatus, HistoryEntry, RetryConfig, WorkflowKind};
pub use scheduler::{CronExpr, DailyScheduler};
pub use storage::{MemoryStore, StateStore, StateStoreExt};
pub use workflows::{CreateStore, DeletePipeline, DeleteStore, IngestPipeline, Workflow};

#[cfg(feature = "sqlite")]
pub use storage::sqlite::SqliteStore;

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Catalog, Config, Engine, EngineConfig, Execution, ExecutionStatus, FlowError,
        MemoryStore, Repository, RepositoryStatus, Result, StateStore, StateStoreExt,
        WorkflowKind,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::SqliteStore;
}
