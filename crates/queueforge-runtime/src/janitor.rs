//! Lease janitor: periodically finds jobs whose lease expired without a
//! heartbeat or completion, and runs them back through the same
//! `complete_attempt`/retry-ladder path a worker would use, so a crashed
//! worker's jobs recover without any special-casing.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use queueforge_core::model::Worker;
use queueforge_core::store::{QueueStore, WorkerRegistry};
use queueforge_orchestrator::Orchestrator;
use tracing::{info, warn};

/// One sweep: reclaim expired leases, then deregister workers that have
/// gone quiet for longer than `stale_threshold`.
///
/// Returns the number of jobs reclaimed and the number of workers
/// deregistered, for callers that want to log or test on the outcome.
pub async fn run_once(
    queue: &Arc<dyn QueueStore>,
    workers: &Arc<dyn WorkerRegistry>,
    orchestrator: &Arc<Orchestrator>,
    stale_threshold: Duration,
    now: DateTime<Utc>,
    reclaim_limit: i64,
) -> Result<(usize, usize), queueforge_core::error::QueueError> {
    let reclaimed = queue.reclaim_expired(now, reclaim_limit).await?;
    for job in &reclaimed {
        warn!(job_id = %job.id, "reclaimed job with expired lease");
        orchestrator.on_job_state_change(job, now).await.ok();
    }

    // `list_active` already filters out stale workers; a near-infinite
    // threshold turns it into "list everyone" so staleness can be checked
    // explicitly and the stale ones deregistered (step 3 leaves workers
    // with no dedicated "inactive" flag — deregistering is the closest
    // operation the registry trait exposes).
    let all_workers = workers.list_active(now, Duration::days(3650)).await?;
    let stale: Vec<&Worker> = all_workers.iter().filter(|w| w.is_stale(now, stale_threshold)).collect();
    for worker in &stale {
        info!(worker_id = %worker.worker_id, "deregistering stale worker");
        workers.deregister(&worker.worker_id).await.ok();
    }

    Ok((reclaimed.len(), stale.len()))
}
