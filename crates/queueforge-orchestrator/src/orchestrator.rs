//! Workflow run lifecycle: starting a run, enqueuing steps whose
//! dependencies are satisfied, reacting to a child job's completion, and
//! cancelling a run in flight. Composes [`QueueStore`]/[`WorkflowStore`]/
//! [`CatalogStore`] trait objects, so the orchestrator is storage-agnostic
//! and can run against `queueforge-testing`'s in-memory fakes in unit
//! tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use queueforge_core::error::QueueError;
use queueforge_core::model::{
    FailurePolicy, Job, JobSource, JobStatus, WorkflowRun, WorkflowRunStatus, WorkflowStepRun,
    WorkflowStepStatus,
};
use queueforge_core::source_ref::{make_workflow_source_ref, parse_workflow_source_ref};
use queueforge_core::store::{
    CatalogStore, EnqueueJob, ErrorUpdate, NewStepRun, QueueStore, WorkflowStats, WorkflowStore,
};
use queueforge_core::validate::{self, PayloadSchema};
use uuid::Uuid;

use crate::dag::validate_steps;

const DEFAULT_PRIORITY: i32 = 100;

/// Composes the three storage traits a workflow run needs, driving step
/// enqueue, job-state propagation, and cascade-cancel.
pub struct Orchestrator {
    queue: Arc<dyn QueueStore>,
    workflows: Arc<dyn WorkflowStore>,
    catalog: Arc<dyn CatalogStore>,
}

impl Orchestrator {
    pub fn new(queue: Arc<dyn QueueStore>, workflows: Arc<dyn WorkflowStore>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self { queue, workflows, catalog }
    }

    /// Starts a new run of `workflow_definition_id`: validates the DAG,
    /// re-validates every step's definition and payload against the current
    /// catalog (definitions may have been deactivated, or their schema
    /// changed, since the workflow was defined), creates the run and its
    /// step rows, enqueues whatever is immediately ready, and reconciles the
    /// run's status before returning.
    ///
    /// Re-validation happens entirely before `create_run`: a step with an
    /// inactive definition or a payload that fails to normalize rejects the
    /// start outright, with no run row left behind — a downstream step that
    /// never becomes ready would otherwise skip this check forever.
    pub async fn start_run(
        &self,
        tenant_id: Uuid,
        workflow_definition_id: Uuid,
        created_by: Option<Uuid>,
        priority: Option<i32>,
        payload: serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, QueueError> {
        let workflow = self.catalog.get_workflow_definition_by_id(workflow_definition_id).await?;
        if !workflow.is_active {
            return Err(QueueError::DefinitionUnavailable(format!(
                "workflow definition {} is inactive",
                workflow.key
            )));
        }
        validate_steps(&workflow.steps)?;

        let mut new_steps = Vec::with_capacity(workflow.steps.len());
        for step in &workflow.steps {
            let definition = self.catalog.get_definition_by_key(&step.definition_key).await?;
            if !definition.is_active {
                return Err(QueueError::DefinitionUnavailable(format!(
                    "definition {} for step {} is inactive",
                    step.definition_key, step.step_key
                )));
            }
            let schema = PayloadSchema::from_arg_schema(&definition.arg_schema)?;
            let normalized_payload = validate::normalize(&schema, &step.payload)?;

            new_steps.push(NewStepRun {
                step_key: step.step_key.clone(),
                definition_id: definition.id,
                payload: normalized_payload,
                depends_on: step.depends_on.clone(),
            });
        }

        let run = self
            .workflows
            .create_run(
                tenant_id,
                workflow.id,
                payload,
                priority.unwrap_or(DEFAULT_PRIORITY),
                workflow.max_parallel_steps.max(1),
                workflow.failure_policy,
                created_by,
                now,
            )
            .await?;

        self.workflows.create_step_runs(run.id, new_steps).await?;

        self.enqueue_ready_steps(run.id, now).await?;
        self.reconcile_run_status(run.id, now).await?;
        tracing::info!(run_id = %run.id, workflow = %workflow.key, "workflow run started");
        self.workflows.get_run(run.id).await
    }

    /// Marks steps whose dependencies all succeeded as `queued` and opens a
    /// child job for each, up to `max_parallel_steps - running_or_queued`
    /// slots of capacity. Steps depending on a failed/canceled/skipped step
    /// are marked `skipped` first, so a blocked branch never silently stalls.
    pub async fn enqueue_ready_steps(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        let run = self.workflows.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        let mut steps = self.workflows.list_step_runs(run_id).await?;

        for step in steps.clone() {
            if step.status != WorkflowStepStatus::Pending {
                continue;
            }
            let blocked = step.depends_on.iter().any(|dep| {
                steps
                    .iter()
                    .find(|s| &s.step_key == dep)
                    .map(|s| s.status.is_terminal_non_success())
                    .unwrap_or(false)
            });
            if blocked {
                let updated = self
                    .workflows
                    .update_step_status(
                        step.id,
                        WorkflowStepStatus::Skipped,
                        None,
                        ErrorUpdate::Set("skipped because a dependency did not succeed".to_string()),
                        now,
                    )
                    .await?;
                if let Some(slot) = steps.iter_mut().find(|s| s.id == step.id) {
                    *slot = updated;
                }
            }
        }

        let running_or_queued = steps
            .iter()
            .filter(|s| matches!(s.status, WorkflowStepStatus::Queued | WorkflowStepStatus::Running))
            .count() as i32;
        let mut capacity = run.max_parallel_steps.max(1) - running_or_queued;
        if capacity <= 0 {
            return Ok(());
        }

        for step in steps.clone() {
            if capacity <= 0 {
                break;
            }
            if step.status != WorkflowStepStatus::Pending {
                continue;
            }
            let deps_satisfied = step.depends_on.iter().all(|dep| {
                steps
                    .iter()
                    .find(|s| &s.step_key == dep)
                    .map(|s| s.status == WorkflowStepStatus::Succeeded)
                    .unwrap_or(false)
            });
            if !deps_satisfied {
                continue;
            }

            match self.enqueue_one_step(&run, &step, now).await? {
                StepEnqueueOutcome::Enqueued => capacity -= 1,
                StepEnqueueOutcome::FailedFast => return Ok(()),
                StepEnqueueOutcome::FailedContinue => {}
            }
        }

        Ok(())
    }

    async fn enqueue_one_step(
        &self,
        run: &WorkflowRun,
        step: &WorkflowStepRun,
        now: DateTime<Utc>,
    ) -> Result<StepEnqueueOutcome, QueueError> {
        let definition = match self.catalog.get_definition_by_id(step.definition_id).await {
            Ok(definition) if definition.is_active => definition,
            _ => {
                return self
                    .fail_step(
                        run,
                        step,
                        format!("definition unavailable for step {}", step.step_key),
                        now,
                    )
                    .await;
            }
        };

        let schema = PayloadSchema::from_arg_schema(&definition.arg_schema)?;
        let normalized_payload = match validate::normalize(&schema, &step.payload) {
            Ok(payload) => payload,
            Err(err) => return self.fail_step(run, step, err.to_string(), now).await,
        };

        let enqueue = EnqueueJob {
            tenant_id: run.tenant_id,
            definition_id: definition.id,
            source: JobSource::System,
            source_ref: Some(make_workflow_source_ref(run.id, &step.step_key)),
            priority: run.priority,
            payload: normalized_payload,
            dedupe_key: Some(format!("workflow-step:{}:{}", run.id, step.step_key)),
            correlation_id: Some(format!("workflow:{}", run.id)),
            scheduled_for: now,
            max_attempts: definition.max_attempts,
            created_by: run.created_by,
        };
        let outcome = self.queue.enqueue(enqueue).await?;
        let child_job_id = outcome.job().id;

        self.workflows
            .update_step_status(step.id, WorkflowStepStatus::Queued, Some(child_job_id), ErrorUpdate::Keep, now)
            .await?;
        Ok(StepEnqueueOutcome::Enqueued)
    }

    async fn fail_step(
        &self,
        run: &WorkflowRun,
        step: &WorkflowStepRun,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<StepEnqueueOutcome, QueueError> {
        self.workflows
            .update_step_status(step.id, WorkflowStepStatus::Failed, None, ErrorUpdate::Set(reason.clone()), now)
            .await?;

        if run.failure_policy == FailurePolicy::FailFast {
            tracing::warn!(run_id = %run.id, step = %step.step_key, %reason, "fail-fast cascade: canceling open steps");
            self.workflows
                .update_run_status(run.id, WorkflowRunStatus::Failed, ErrorUpdate::Set(reason.clone()), now)
                .await?;
            self.cancel_open_steps(run.id, &reason, now).await?;
            Ok(StepEnqueueOutcome::FailedFast)
        } else {
            self.workflows
                .update_run_status(run.id, run.status, ErrorUpdate::Set(reason), now)
                .await?;
            Ok(StepEnqueueOutcome::FailedContinue)
        }
    }

    async fn cancel_open_steps(&self, run_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let steps = self.workflows.list_step_runs(run_id).await?;
        for step in steps.into_iter().filter(|s| s.status.is_open()) {
            self.workflows
                .update_step_status(step.id, WorkflowStepStatus::Canceled, None, ErrorUpdate::Set(reason.to_string()), now)
                .await?;
            if let Some(job_id) = step.child_job_id {
                if let Ok(job) = self.queue.get_job(job_id).await {
                    if job.status.is_open() {
                        self.queue.cancel(job_id, reason, now).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Recomputes `WorkflowRun.status` from the current set of step
    /// statuses: `succeeded` once every step is `succeeded`/`skipped`,
    /// `failed`/`canceled` once every step is terminal and at least one
    /// failed or was canceled, otherwise still `running`.
    pub async fn reconcile_run_status(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<WorkflowRun, QueueError> {
        let run = self.workflows.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let steps = self.workflows.list_step_runs(run_id).await?;
        if steps.is_empty() {
            return self
                .workflows
                .update_run_status(run_id, WorkflowRunStatus::Failed, ErrorUpdate::Set("workflow has no steps".to_string()), now)
                .await;
        }

        let all_terminal = steps.iter().all(|s| s.status.is_terminal());
        if !all_terminal {
            return Ok(run);
        }

        let has_failed = steps.iter().any(|s| s.status == WorkflowStepStatus::Failed);
        let has_canceled = steps.iter().any(|s| s.status == WorkflowStepStatus::Canceled);
        let status = if has_failed {
            WorkflowRunStatus::Failed
        } else if has_canceled {
            WorkflowRunStatus::Canceled
        } else {
            WorkflowRunStatus::Succeeded
        };
        let last_error = if status == WorkflowRunStatus::Succeeded { ErrorUpdate::Clear } else { ErrorUpdate::Keep };
        self.workflows.update_run_status(run_id, status, last_error, now).await
    }

    /// Marks the step owning `job` as `running` the moment its child job is
    /// claimed, without re-evaluating readiness or run status — a sibling
    /// entering `running` never makes another step ready (distinct from
    /// [`Orchestrator::on_job_state_change`]). A no-op for
    /// jobs that were not created by a workflow step, or whose step is
    /// already terminal or already `running`.
    pub async fn on_child_claimed(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        let Some((run_id, step_key)) = job.source_ref.as_deref().and_then(|r| parse_workflow_source_ref(r).ok()) else {
            return Ok(());
        };
        let steps = self.workflows.list_step_runs(run_id).await?;
        let Some(step) = steps.iter().find(|s| s.step_key == step_key) else { return Ok(()) };
        if step.status.is_terminal() || step.status == WorkflowStepStatus::Running {
            return Ok(());
        }
        self.workflows
            .update_step_status(step.id, WorkflowStepStatus::Running, None, ErrorUpdate::Keep, now)
            .await?;
        Ok(())
    }

    /// Applies a job's status change to its owning workflow step, cascading
    /// fail-fast cancellation or re-evaluating readiness as needed (spec
    /// §5.4). A no-op for jobs that were not created by a workflow step.
    pub async fn on_job_state_change(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        let Some((run_id, step_key)) = job.source_ref.as_deref().and_then(|r| parse_workflow_source_ref(r).ok()) else {
            return Ok(());
        };

        let run = self.workflows.get_run(run_id).await?;
        let steps = self.workflows.list_step_runs(run_id).await?;
        let Some(step) = steps.iter().find(|s| s.step_key == step_key) else { return Ok(()) };
        if step.status.is_terminal() {
            return Ok(());
        }

        let (next_status, reason) = match job.status {
            JobStatus::Queued => (WorkflowStepStatus::Queued, None),
            JobStatus::Running => (WorkflowStepStatus::Running, None),
            JobStatus::Succeeded => (WorkflowStepStatus::Succeeded, None),
            JobStatus::Failed | JobStatus::DeadLetter => (
                WorkflowStepStatus::Failed,
                Some(job.last_error.clone().unwrap_or_else(|| format!("job ended with {}", job.status))),
            ),
            JobStatus::Canceled => (
                WorkflowStepStatus::Canceled,
                Some(job.last_error.clone().unwrap_or_else(|| "canceled".to_string())),
            ),
        };

        let error_update = match (&reason, next_status) {
            (Some(reason), _) => ErrorUpdate::Set(reason.clone()),
            (None, WorkflowStepStatus::Succeeded) => ErrorUpdate::Clear,
            (None, _) => ErrorUpdate::Keep,
        };
        self.workflows.update_step_status(step.id, next_status, None, error_update, now).await?;

        if run.status.is_terminal() {
            self.reconcile_run_status(run_id, now).await?;
            return Ok(());
        }

        let terminal_failure = matches!(next_status, WorkflowStepStatus::Failed | WorkflowStepStatus::Canceled);
        if terminal_failure && run.failure_policy == FailurePolicy::FailFast {
            let run_status = if next_status == WorkflowStepStatus::Failed {
                WorkflowRunStatus::Failed
            } else {
                WorkflowRunStatus::Canceled
            };
            let reason = reason.unwrap_or_else(|| "a workflow step failed".to_string());
            tracing::warn!(%run_id, step = %step_key, %reason, "fail-fast cascade: canceling open steps");
            self.workflows.update_run_status(run_id, run_status, ErrorUpdate::Set(reason.clone()), now).await?;
            self.cancel_open_steps(run_id, &reason, now).await?;
            self.reconcile_run_status(run_id, now).await?;
            return Ok(());
        }

        self.enqueue_ready_steps(run_id, now).await?;
        self.reconcile_run_status(run_id, now).await?;
        Ok(())
    }

    /// Cancels a run and every open step/child job. Returns `false` if the
    /// run was already terminal.
    pub async fn cancel_run(&self, run_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let run = self.workflows.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        tracing::info!(%run_id, %reason, "workflow run canceled");
        self.workflows
            .update_run_status(run_id, WorkflowRunStatus::Canceled, ErrorUpdate::Set(reason.to_string()), now)
            .await?;
        self.cancel_open_steps(run_id, reason, now).await?;
        self.reconcile_run_status(run_id, now).await?;
        Ok(true)
    }

    /// Per-status workflow run counters for `tenant_id`.
    pub async fn stats(&self, tenant_id: Uuid) -> Result<WorkflowStats, QueueError> {
        self.workflows.stats(tenant_id).await
    }
}

enum StepEnqueueOutcome {
    Enqueued,
    FailedFast,
    FailedContinue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use queueforge_core::model::{AttemptOutcome, FailurePolicy, WorkflowStepSpec};
    use queueforge_core::store::CompleteAttempt;
    use queueforge_testing::{job_definition, workflow_definition, InMemoryStore};
    use serde_json::Map;

    fn wire(store: &Arc<InMemoryStore>) -> Orchestrator {
        let queue: Arc<dyn QueueStore> = store.clone();
        let workflows: Arc<dyn WorkflowStore> = store.clone();
        let catalog: Arc<dyn CatalogStore> = store.clone();
        Orchestrator::new(queue, workflows, catalog)
    }

    fn step(key: &str, definition_key: &str, depends_on: &[&str]) -> WorkflowStepSpec {
        WorkflowStepSpec {
            step_key: key.to_string(),
            definition_key: definition_key.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            payload: Map::new(),
        }
    }

    fn find<'a>(steps: &'a [WorkflowStepRun], key: &str) -> &'a WorkflowStepRun {
        steps.iter().find(|s| s.step_key == key).unwrap_or_else(|| panic!("no step {key}"))
    }

    #[tokio::test]
    async fn start_run_enqueues_only_steps_whose_dependencies_are_satisfied() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_definition(job_definition("a_def"));
        store.seed_definition(job_definition("b_def"));
        store.seed_definition(job_definition("c_def"));
        store.seed_definition(job_definition("d_def"));

        let steps = vec![
            step("a", "a_def", &[]),
            step("b", "b_def", &["a"]),
            step("c", "c_def", &["a"]),
            step("d", "d_def", &["b", "c"]),
        ];
        let workflow_id = store.seed_workflow_definition(workflow_definition("diamond", steps));
        let orchestrator = wire(&store);

        let now = Utc::now();
        let run = orchestrator
            .start_run(Uuid::new_v4(), workflow_id, None, None, Map::new(), now)
            .await
            .unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Running);

        let workflows: Arc<dyn WorkflowStore> = store.clone();
        let steps = workflows.list_step_runs(run.id).await.unwrap();
        assert_eq!(find(&steps, "a").status, WorkflowStepStatus::Queued);
        assert!(find(&steps, "a").child_job_id.is_some());
        assert_eq!(find(&steps, "b").status, WorkflowStepStatus::Pending);
        assert_eq!(find(&steps, "c").status, WorkflowStepStatus::Pending);
        assert_eq!(find(&steps, "d").status, WorkflowStepStatus::Pending);
    }

    #[tokio::test]
    async fn a_succeeding_step_unblocks_its_dependents() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_definition(job_definition("a_def"));
        store.seed_definition(job_definition("b_def"));

        let steps = vec![step("a", "a_def", &[]), step("b", "b_def", &["a"])];
        let workflow_id = store.seed_workflow_definition(workflow_definition("linear", steps));
        let orchestrator = wire(&store);

        let now = Utc::now();
        let run = orchestrator
            .start_run(Uuid::new_v4(), workflow_id, None, None, Map::new(), now)
            .await
            .unwrap();

        let queue: Arc<dyn QueueStore> = store.clone();
        let workflows: Arc<dyn WorkflowStore> = store.clone();
        let a_job_id = find(&workflows.list_step_runs(run.id).await.unwrap(), "a").child_job_id.unwrap();

        let claimed = queue
            .claim_ready("worker-1", &["*".to_string()], 10, chrono::Duration::seconds(60), now)
            .await
            .unwrap();
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
        let completed_job = queue.get_job(a_job_id).await.unwrap();
        orchestrator.on_job_state_change(&completed_job, now).await.unwrap();

        let steps = workflows.list_step_runs(run.id).await.unwrap();
        assert_eq!(find(&steps, "a").status, WorkflowStepStatus::Succeeded);
        assert_eq!(find(&steps, "b").status, WorkflowStepStatus::Queued);
        assert!(find(&steps, "b").child_job_id.is_some());

        let run = workflows.get_run(run.id).await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Running);
    }

    #[tokio::test]
    async fn fail_fast_cancels_every_open_step_including_independent_branches() {
        let store = Arc::new(InMemoryStore::new());
        let mut a_def = job_definition("a_def");
        a_def.max_attempts = 1;
        store.seed_definition(a_def);
        store.seed_definition(job_definition("b_def"));
        store.seed_definition(job_definition("c_def"));

        // b depends on a; c is an independent branch that starts in parallel.
        let steps = vec![step("a", "a_def", &[]), step("b", "b_def", &["a"]), step("c", "c_def", &[])];
        let mut workflow = workflow_definition("fans-out", steps);
        workflow.failure_policy = FailurePolicy::FailFast;
        workflow.max_parallel_steps = 2;
        let workflow_id = store.seed_workflow_definition(workflow);
        let orchestrator = wire(&store);

        let now = Utc::now();
        let run = orchestrator
            .start_run(Uuid::new_v4(), workflow_id, None, None, Map::new(), now)
            .await
            .unwrap();

        let queue: Arc<dyn QueueStore> = store.clone();
        let workflows: Arc<dyn WorkflowStore> = store.clone();
        let initial = workflows.list_step_runs(run.id).await.unwrap();
        assert_eq!(find(&initial, "a").status, WorkflowStepStatus::Queued);
        assert_eq!(find(&initial, "c").status, WorkflowStepStatus::Queued);
        assert_eq!(find(&initial, "b").status, WorkflowStepStatus::Pending);

        let a_job_id = find(&initial, "a").child_job_id.unwrap();
        let claimed = queue
            .claim_ready("worker-1", &["*".to_string()], 10, chrono::Duration::seconds(60), now)
            .await
            .unwrap();
        let attempt = claimed.iter().find(|c| c.job.id == a_job_id).unwrap().attempt.clone();
        queue
            .complete_attempt(
                CompleteAttempt {
                    job_id: a_job_id,
                    attempt_id: attempt.id,
                    worker_id: "worker-1".to_string(),
                    outcome: AttemptOutcome::Failed,
                    exit_code: Some(1),
                    stdout_tail: None,
                    stderr_tail: None,
                    error_text: Some("boom".to_string()),
                },
                now,
            )
            .await
            .unwrap();
        let failed_job = queue.get_job(a_job_id).await.unwrap();
        assert_eq!(failed_job.status, JobStatus::DeadLetter);

        orchestrator.on_job_state_change(&failed_job, now).await.unwrap();

        let steps = workflows.list_step_runs(run.id).await.unwrap();
        assert_eq!(find(&steps, "a").status, WorkflowStepStatus::Failed);
        assert_eq!(find(&steps, "b").status, WorkflowStepStatus::Canceled);
        assert_eq!(find(&steps, "c").status, WorkflowStepStatus::Canceled);

        let c_job_id = find(&initial, "c").child_job_id.unwrap();
        let c_job = queue.get_job(c_job_id).await.unwrap();
        assert_eq!(c_job.status, JobStatus::Canceled);

        let run = workflows.get_run(run.id).await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Failed);
    }

    #[tokio::test]
    async fn on_child_claimed_marks_the_step_running_without_touching_siblings() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_definition(job_definition("a_def"));
        store.seed_definition(job_definition("b_def"));
        let steps = vec![step("a", "a_def", &[]), step("b", "b_def", &[])];
        let workflow_id = store.seed_workflow_definition(workflow_definition("two_independent", steps));
        let orchestrator = wire(&store);

        let now = Utc::now();
        let run = orchestrator
            .start_run(Uuid::new_v4(), workflow_id, None, None, Map::new(), now)
            .await
            .unwrap();

        let queue: Arc<dyn QueueStore> = store.clone();
        let workflows: Arc<dyn WorkflowStore> = store.clone();
        let a_job_id = find(&workflows.list_step_runs(run.id).await.unwrap(), "a").child_job_id.unwrap();
        queue
            .claim_ready("worker-1", &["*".to_string()], 10, chrono::Duration::seconds(60), now)
            .await
            .unwrap();
        let a_job = queue.get_job(a_job_id).await.unwrap();

        orchestrator.on_child_claimed(&a_job, now).await.unwrap();

        let steps = workflows.list_step_runs(run.id).await.unwrap();
        assert_eq!(find(&steps, "a").status, WorkflowStepStatus::Running);
        // b was also claimed in the same batch but on_child_claimed was only
        // told about a — its step must be untouched.
        assert_eq!(find(&steps, "b").status, WorkflowStepStatus::Queued);

        // Idempotent: calling it again with the job still running is a no-op.
        orchestrator.on_child_claimed(&a_job, now).await.unwrap();
        let steps = workflows.list_step_runs(run.id).await.unwrap();
        assert_eq!(find(&steps, "a").status, WorkflowStepStatus::Running);
    }

    #[tokio::test]
    async fn stats_counts_runs_by_status_for_the_tenant() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_definition(job_definition("a_def"));
        let workflow_id = store.seed_workflow_definition(workflow_definition("single", vec![step("a", "a_def", &[])]));
        let orchestrator = wire(&store);
        let tenant_id = Uuid::new_v4();

        let now = Utc::now();
        let run_a = orchestrator.start_run(tenant_id, workflow_id, None, None, Map::new(), now).await.unwrap();
        let run_b = orchestrator.start_run(tenant_id, workflow_id, None, None, Map::new(), now).await.unwrap();
        orchestrator.cancel_run(run_b.id, "not needed anymore", now).await.unwrap();
        // A run for a different tenant must not be counted.
        orchestrator.start_run(Uuid::new_v4(), workflow_id, None, None, Map::new(), now).await.unwrap();

        let stats = orchestrator.stats(tenant_id).await.unwrap();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.canceled, 1);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.failed, 0);
        let _ = run_a;
    }

    #[tokio::test]
    async fn cancel_run_cancels_open_steps_and_their_jobs() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_definition(job_definition("a_def"));
        let steps = vec![step("a", "a_def", &[])];
        let workflow_id = store.seed_workflow_definition(workflow_definition("single", steps));
        let orchestrator = wire(&store);

        let now = Utc::now();
        let run = orchestrator
            .start_run(Uuid::new_v4(), workflow_id, None, None, Map::new(), now)
            .await
            .unwrap();

        let canceled = orchestrator.cancel_run(run.id, "operator request", now).await.unwrap();
        assert!(canceled);

        let workflows: Arc<dyn WorkflowStore> = store.clone();
        let run = workflows.get_run(run.id).await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Canceled);
        let steps = workflows.list_step_runs(run.id).await.unwrap();
        assert_eq!(find(&steps, "a").status, WorkflowStepStatus::Canceled);

        // Canceling an already-terminal run is a no-op.
        let again = orchestrator.cancel_run(run.id, "operator request", now).await.unwrap();
        assert!(!again);
    }
}
