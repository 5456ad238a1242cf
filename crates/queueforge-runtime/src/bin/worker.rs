//! Worker binary: claims jobs, executes them through a [`HandlerRegistry`],
//! and reports outcomes.
//!
//! Handlers are not wired here — embedders fork this binary (or call
//! [`queueforge_runtime::WorkerRuntime`] directly) and register their own
//! [`queueforge_runtime::JobHandler`] impls per definition key before
//! calling `run`. This binary registers none, so every claimed job fails
//! immediately with "no handler registered" — useful for smoke-testing the
//! claim/heartbeat/shutdown plumbing against a real database.

use std::sync::Arc;

use queueforge_core::store::{CatalogStore, QueueStore, WorkerRegistry, WorkflowStore};
use queueforge_orchestrator::Orchestrator;
use queueforge_postgres::{PgCatalogStore, PgQueueStore, PgWorkerRegistry, PgWorkflowStore};
use queueforge_runtime::{HandlerRegistry, RuntimeConfig, WorkerRuntime};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = RuntimeConfig::from_env()?;
    let pool = PgPoolOptions::new().max_connections(config.concurrency as u32 + 2).connect(&config.database_url).await?;

    let queue: Arc<dyn QueueStore> = Arc::new(PgQueueStore::new(pool.clone()));
    let catalog: Arc<dyn CatalogStore> = Arc::new(PgCatalogStore::new(pool.clone()));
    let workers: Arc<dyn WorkerRegistry> = Arc::new(PgWorkerRegistry::new(pool.clone()));
    let workflows: Arc<dyn WorkflowStore> = Arc::new(PgWorkflowStore::new(pool.clone()));
    let orchestrator = Arc::new(Orchestrator::new(queue.clone(), workflows, catalog.clone()));

    let runtime = WorkerRuntime::new(queue, catalog, workers, orchestrator, Arc::new(HandlerRegistry::new()), config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        let _ = shutdown_tx.send(true);
    });

    runtime.run(shutdown_rx).await
}
