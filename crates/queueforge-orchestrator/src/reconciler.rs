//! Crash-recovery sweep over running workflow runs: recovers a run when a
//! worker crashed between a child job's completion and the orchestrator's
//! normal `on_job_state_change` callback running for it. Routes each child
//! job back through [`Orchestrator::on_job_state_change`] — same source of
//! truth as the live path, so it also gets fail-fast cascade-cancel for
//! free.
//!
//! The sweep orders running runs by `queued_at`, but starts at a
//! `fastrand`-chosen offset into that ordering so a single long-stuck run
//! can't monopolize every cycle's `limit_runs` budget ahead of every other
//! run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use queueforge_core::error::QueueError;
use queueforge_core::store::{QueueStore, WorkflowStore};
use uuid::Uuid;

use crate::orchestrator::Orchestrator;

/// Running run ids are fetched up to this many at a time before the fairness
/// rotation is applied; large enough that a typical deployment's full
/// running set fits in one fetch.
const FETCH_WINDOW: i64 = 2_000;

/// Sweeps up to `limit_runs` running workflow runs, syncing each step's
/// status from its child job and re-running readiness/reconciliation.
/// Returns the number of runs processed.
pub async fn reconcile_running_workflows(
    orchestrator: &Orchestrator,
    workflows: &Arc<dyn WorkflowStore>,
    queue: &Arc<dyn QueueStore>,
    limit_runs: i64,
    now: DateTime<Utc>,
) -> Result<usize, QueueError> {
    let mut run_ids = workflows.list_running_run_ids(FETCH_WINDOW).await?;
    if run_ids.is_empty() {
        return Ok(0);
    }

    let offset = fastrand::usize(..run_ids.len());
    run_ids.rotate_left(offset);
    let limit = limit_runs.max(1) as usize;
    run_ids.truncate(limit);

    let mut processed = 0usize;
    for run_id in run_ids {
        if reconcile_one_run(orchestrator, workflows, queue, run_id, now).await? {
            processed += 1;
        }
    }
    tracing::debug!(processed, offset, "reconciled running workflow runs");
    Ok(processed)
}

async fn reconcile_one_run(
    orchestrator: &Orchestrator,
    workflows: &Arc<dyn WorkflowStore>,
    queue: &Arc<dyn QueueStore>,
    run_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, QueueError> {
    let run = workflows.get_run(run_id).await?;
    if run.status.is_terminal() {
        return Ok(false);
    }

    let steps = workflows.list_step_runs(run_id).await?;
    for step in steps {
        let Some(job_id) = step.child_job_id else { continue };
        let job = match queue.get_job(job_id).await {
            Ok(job) => job,
            Err(QueueError::NotFound(_)) => continue,
            Err(err) => return Err(err),
        };
        orchestrator.on_job_state_change(&job, now).await?;
    }

    orchestrator.enqueue_ready_steps(run_id, now).await?;
    orchestrator.reconcile_run_status(run_id, now).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use queueforge_core::model::{AttemptOutcome, WorkflowRunStatus, WorkflowStepSpec, WorkflowStepStatus};
    use queueforge_core::store::{CatalogStore, CompleteAttempt};
    use queueforge_testing::{job_definition, workflow_definition, InMemoryStore};
    use serde_json::Map;

    fn step(key: &str, definition_key: &str, depends_on: &[&str]) -> WorkflowStepSpec {
        WorkflowStepSpec {
            step_key: key.to_string(),
            definition_key: definition_key.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            payload: Map::new(),
        }
    }

    fn wire(store: &Arc<InMemoryStore>) -> (Orchestrator, Arc<dyn QueueStore>, Arc<dyn WorkflowStore>) {
        let queue: Arc<dyn QueueStore> = store.clone();
        let workflows: Arc<dyn WorkflowStore> = store.clone();
        let catalog: Arc<dyn CatalogStore> = store.clone();
        (Orchestrator::new(queue.clone(), workflows.clone(), catalog), queue, workflows)
    }

    /// Simulates the case the sweep exists for: a step's child job finished
    /// but the orchestrator's normal `on_job_state_change` callback never ran
    /// for it (the worker process that would have called it crashed).
    #[tokio::test]
    async fn sweep_advances_a_run_whose_job_completion_was_missed() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_definition(job_definition("a_def"));
        store.seed_definition(job_definition("b_def"));
        let steps = vec![step("a", "a_def", &[]), step("b", "b_def", &["a"])];
        let workflow_id = store.seed_workflow_definition(workflow_definition("linear", steps));
        let (orchestrator, queue, workflows) = wire(&store);

        let now = Utc::now();
        let run = orchestrator.start_run(Uuid::new_v4(), workflow_id, None, None, Map::new(), now).await.unwrap();

        let a_job_id = workflows.list_step_runs(run.id).await.unwrap().into_iter().find(|s| s.step_key == "a").unwrap().child_job_id.unwrap();
        let claimed = queue.claim_ready("worker-1", &["*".to_string()], 10, chrono::Duration::seconds(60), now).await.unwrap();
        let attempt = claimed.iter().find(|c| c.job.id == a_job_id).unwrap().attempt.clone();
        queue
            .complete_attempt(
                CompleteAttempt {
                    job_id: a_job_id,
                    attempt_id: attempt.id,
                    worker_id: "worker-1".to_string(),
                    outcome: AttemptOutcome::Succeeded,
                    exit_code: Some(0),
                    stdout_tail: None,
                    stderr_tail: None,
                    error_text: None,
                },
                now,
            )
            .await
            .unwrap();

        // `orchestrator.on_job_state_change` is deliberately never called here
        // — the sweep is what's under test.
        let processed = reconcile_running_workflows(&orchestrator, &workflows, &queue, 10, now).await.unwrap();
        assert_eq!(processed, 1);

        let steps = workflows.list_step_runs(run.id).await.unwrap();
        assert_eq!(steps.iter().find(|s| s.step_key == "a").unwrap().status, WorkflowStepStatus::Succeeded);
        assert_eq!(steps.iter().find(|s| s.step_key == "b").unwrap().status, WorkflowStepStatus::Queued);
    }

    #[tokio::test]
    async fn sweep_is_a_noop_when_nothing_is_running() {
        let store = Arc::new(InMemoryStore::new());
        let (orchestrator, queue, workflows) = wire(&store);
        let processed = reconcile_running_workflows(&orchestrator, &workflows, &queue, 10, Utc::now()).await.unwrap();
        assert_eq!(processed, 0);
    }

    #[tokio::test]
    async fn sweep_skips_runs_already_terminal() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_definition(job_definition("a_def"));
        let workflow_id = store.seed_workflow_definition(workflow_definition("single", vec![step("a", "a_def", &[])]));
        let (orchestrator, queue, workflows) = wire(&store);

        let now = Utc::now();
        let run = orchestrator.start_run(Uuid::new_v4(), workflow_id, None, None, Map::new(), now).await.unwrap();
        orchestrator.cancel_run(run.id, "done with it", now).await.unwrap();
        assert_eq!(workflows.get_run(run.id).await.unwrap().status, WorkflowRunStatus::Canceled);

        let processed = reconcile_running_workflows(&orchestrator, &workflows, &queue, 10, now).await.unwrap();
        assert_eq!(processed, 0);
    }
}
