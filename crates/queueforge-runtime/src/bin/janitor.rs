//! Lease janitor binary: reclaims expired leases and deregisters stale
//! workers every `janitor_interval`.

use std::sync::Arc;

use chrono::Duration;
use queueforge_core::store::{CatalogStore, QueueStore, WorkerRegistry, WorkflowStore};
use queueforge_orchestrator::Orchestrator;
use queueforge_postgres::{PgCatalogStore, PgQueueStore, PgWorkerRegistry, PgWorkflowStore};
use queueforge_runtime::RuntimeConfig;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = RuntimeConfig::from_env()?;
    let pool = PgPoolOptions::new().max_connections(4).connect(&config.database_url).await?;

    let queue: Arc<dyn QueueStore> = Arc::new(PgQueueStore::new(pool.clone()));
    let catalog: Arc<dyn CatalogStore> = Arc::new(PgCatalogStore::new(pool.clone()));
    let workers: Arc<dyn WorkerRegistry> = Arc::new(PgWorkerRegistry::new(pool.clone()));
    let workflows: Arc<dyn WorkflowStore> = Arc::new(PgWorkflowStore::new(pool.clone()));
    let orchestrator = Arc::new(Orchestrator::new(queue.clone(), workflows, catalog));

    let stale_threshold = Duration::from_std(config.stale_threshold)?;
    let mut ticker = tokio::time::interval(config.janitor_interval);
    loop {
        ticker.tick().await;
        match queueforge_runtime::janitor::run_once(&queue, &workers, &orchestrator, stale_threshold, chrono::Utc::now(), 500).await {
            Ok((reclaimed, stale)) => {
                if reclaimed > 0 || stale > 0 {
                    tracing::info!(reclaimed, stale, "janitor sweep complete");
                }
            }
            Err(err) => tracing::warn!(%err, "janitor sweep failed"),
        }
    }
}
