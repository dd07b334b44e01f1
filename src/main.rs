//! kbflow server
//!
//! Run with: `cargo run` or `kbflow`
//!
//! Configuration via environment variables:
//! - KBFLOW_DATABASE__PATH: SQLite file path (default: kbflow.db)
//! - KBFLOW_SERVER__PORT: port to listen on (default: 8080)
//! - KBFLOW_TASKS__ENDPOINT: base URL of the task service
//! - KBFLOW_SCHEDULER__DAILY_CRON: daily ingestion schedule (default: 0 3 * * *)

use std::sync::Arc;

use kbflow::{
    api::{self, AppState},
    config::{Config, DatabaseConfig},
    tasks::{Collaborators, HttpTasks},
    Catalog, DailyScheduler, Engine, StateStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kbflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting kbflow server...");

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Invalid configuration, using defaults");
        Config::default()
    });

    match &config.database {
        #[cfg(feature = "sqlite")]
        DatabaseConfig::Sqlite { path } => {
            use kbflow::SqliteStore;

            tracing::info!("Connecting to SQLite at {}...", path);
            let store = SqliteStore::connect(&config.database.url()).await?;
            store.migrate().await?;
            tracing::info!("Database migrated");

            run_server(config, store).await
        }

        #[allow(unreachable_patterns)]
        _ => {
            anyhow::bail!("No database backend enabled. Compile with --features sqlite");
        }
    }
}

async fn run_server<S: StateStore + Catalog + Clone>(config: Config, store: S) -> anyhow::Result<()> {
    let tasks = Arc::new(HttpTasks::new(&config.tasks)?);
    tracing::info!(endpoint = %tasks.endpoint(), "Task service configured");

    let engine = Arc::new(
        Engine::new(store, Collaborators::remote(tasks), config.worker.clone().into())
            .with_settings(config.workflows.clone())
            .with_concurrency(config.concurrency.clone()),
    );
    let engine_shutdown = engine.shutdown_handle();

    let engine_task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    let scheduler = if config.scheduler.enabled {
        let scheduler = Arc::new(DailyScheduler::new(engine.clone(), &config.scheduler)?);
        let handle = scheduler.shutdown_handle();
        let task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };
        Some((handle, task))
    } else {
        tracing::info!("Daily scheduler disabled");
        None
    };

    let state = Arc::new(AppState {
        engine: engine.clone(),
    });
    let app = api::router(state);

    let addr = config.server.address();
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    let _ = engine_shutdown.send(());
    if let Some((handle, task)) = scheduler {
        let _ = handle.send(());
        task.await??;
    }
    engine_task.await??;

    Ok(())
}
