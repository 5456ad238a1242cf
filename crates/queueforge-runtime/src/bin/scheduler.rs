//! Schedule-trigger binary: wakes periodically and fires due cron triggers.
//!
//! Event triggers are not driven here — they fire inline wherever
//! `publish_event` is called (the control API), not from a poll loop.

use std::sync::Arc;

use queueforge_core::store::{QueueStore, TriggerStore};
use queueforge_postgres::{PgQueueStore, PgTriggerStore};
use queueforge_runtime::RuntimeConfig;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

/// Schedule triggers are checked on the same cadence as the poll loop's
/// `poll_interval`, not the janitor's slower interval — a minute-granularity
/// cron expression needs sub-minute polling to fire close to its nominal time.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = RuntimeConfig::from_env()?;
    let pool = PgPoolOptions::new().max_connections(2).connect(&config.database_url).await?;

    let queue: Arc<dyn QueueStore> = Arc::new(PgQueueStore::new(pool.clone()));
    let triggers: Arc<dyn TriggerStore> = Arc::new(PgTriggerStore::new(pool.clone()));

    let mut ticker = tokio::time::interval(config.poll_interval);
    loop {
        ticker.tick().await;
        match queueforge_runtime::trigger::run_schedule_tick(&triggers, &queue, chrono::Utc::now()).await {
            Ok(fired) if !fired.is_empty() => tracing::info!(count = fired.len(), "schedule triggers fired"),
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "schedule tick failed"),
        }
    }
}
