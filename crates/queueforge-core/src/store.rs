//! Storage traits: claim/heartbeat/complete and friends as separate async
//! methods on trait objects usable across storage backends, covering the
//! full job + workflow + trigger + worker surface. Only
//! `queueforge-postgres` implements these against real tables;
//! `queueforge-testing` implements them in-memory for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{InsertOutcome, QueueError};
use crate::model::{
    AttemptOutcome, Job, JobAttempt, JobDefinition, JobTrigger, Worker, WorkflowDefinition,
    WorkflowRun, WorkflowStepRun,
};

/// How a status-update call should treat the stored `last_error`: most
/// transitions (queued, running) carry no error of their own and should
/// leave whatever is already there; a transition into `failed`/`canceled`
/// sets a new one; a transition into `succeeded` must clear it, which a
/// bare `Option<String>` can't express since `None` would otherwise mean
/// "leave it alone".
#[derive(Debug, Clone)]
pub enum ErrorUpdate {
    Keep,
    Clear,
    Set(String),
}

impl ErrorUpdate {
    pub fn as_deref(&self) -> Option<&str> {
        match self {
            ErrorUpdate::Set(s) => Some(s.as_str()),
            ErrorUpdate::Keep | ErrorUpdate::Clear => None,
        }
    }
}

/// Arguments to enqueue one job.
#[derive(Debug, Clone)]
pub struct EnqueueJob {
    pub tenant_id: Uuid,
    pub definition_id: Uuid,
    pub source: crate::model::JobSource,
    pub source_ref: Option<String>,
    pub priority: i32,
    pub payload: Map<String, Value>,
    pub dedupe_key: Option<String>,
    pub correlation_id: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub max_attempts: i32,
    pub created_by: Option<Uuid>,
}

/// A job claimed by a worker, along with the attempt row opened for it —
/// claim and attempt-open happen atomically.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub attempt: JobAttempt,
}

/// Arguments to report the outcome of a claimed attempt.
#[derive(Debug, Clone)]
pub struct CompleteAttempt {
    pub job_id: Uuid,
    pub attempt_id: Uuid,
    pub worker_id: String,
    pub outcome: AttemptOutcome,
    pub exit_code: Option<i32>,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
    pub error_text: Option<String>,
}

/// Aggregate counters exposed for observability.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub canceled: i64,
}

/// Durable job queue operations.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts a new job, or returns the existing active row if `dedupe_key`
    /// collides with one already `queued`/`running` for the same tenant +
    /// definition.
    async fn enqueue(&self, job: EnqueueJob) -> Result<InsertOutcome, QueueError>;

    /// Claims up to `limit` ready jobs (`scheduled_for <= now`, `queued`,
    /// highest priority / oldest `queued_at` / lowest `id` first) for
    /// `worker_id`, opening one [`JobAttempt`] per claimed job.
    async fn claim_ready(
        &self,
        worker_id: &str,
        queues: &[String],
        limit: i64,
        lease_duration: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, QueueError>;

    /// Extends the lease on a running job this worker still holds. Returns
    /// [`QueueError::LeaseLost`] if the job moved on without this worker.
    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        extend_by: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Records the outcome of an attempt, and applies the retry ladder or
    /// dead-letter transition for `Failed`/`Timeout` outcomes.
    async fn complete_attempt(&self, completion: CompleteAttempt, now: DateTime<Utc>) -> Result<Job, QueueError>;

    /// Reclaims jobs whose lease expired without a heartbeat or completion,
    /// synthesizing a `Timeout` outcome for the open attempt.
    async fn reclaim_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, QueueError>;

    /// Cancels a job if it is still `queued` or `running`; a no-op on
    /// already-terminal jobs.
    async fn cancel(&self, job_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError>;

    /// Moves a `dead_letter` job back to `queued` with a fresh attempt
    /// budget — an operator-triggered action, not automatic.
    async fn requeue_dead_letter(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Job, QueueError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Job, QueueError>;

    async fn stats(&self, tenant_id: Uuid) -> Result<QueueStats, QueueError>;
}

/// Catalog operations over [`JobDefinition`]s and [`WorkflowDefinition`]s.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_definition_by_key(&self, key: &str) -> Result<JobDefinition, QueueError>;
    async fn get_definition_by_id(&self, id: Uuid) -> Result<JobDefinition, QueueError>;
    async fn list_definitions(&self, active_only: bool) -> Result<Vec<JobDefinition>, QueueError>;

    async fn get_workflow_definition_by_key(&self, key: &str) -> Result<WorkflowDefinition, QueueError>;
    async fn get_workflow_definition_by_id(&self, id: Uuid) -> Result<WorkflowDefinition, QueueError>;
}

/// Arguments to create a trigger.
#[derive(Debug, Clone)]
pub struct CreateTrigger {
    pub tenant_id: Uuid,
    pub label: String,
    pub trigger_type: crate::model::TriggerType,
    pub event_name: Option<String>,
    pub cron_expr: Option<String>,
    pub timezone: Option<String>,
    pub definition_id: Uuid,
    pub payload_template: Map<String, Value>,
    pub dedupe_window_seconds: i32,
    pub created_by: Option<Uuid>,
}

/// Event/schedule trigger operations.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn create_trigger(&self, trigger: CreateTrigger) -> Result<JobTrigger, QueueError>;
    async fn set_enabled(&self, trigger_id: Uuid, enabled: bool) -> Result<JobTrigger, QueueError>;
    async fn list_event_triggers(&self, tenant_id: Uuid, event_name: &str) -> Result<Vec<JobTrigger>, QueueError>;
    async fn list_schedule_triggers(&self, due_before: DateTime<Utc>) -> Result<Vec<JobTrigger>, QueueError>;
    async fn record_fired(&self, trigger_id: Uuid, fired_at: DateTime<Utc>) -> Result<(), QueueError>;
}

/// Worker registry operations.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register(&self, worker: Worker) -> Result<(), QueueError>;
    async fn heartbeat_worker(&self, worker_id: &str, now: DateTime<Utc>, running_count: i32) -> Result<(), QueueError>;
    async fn deregister(&self, worker_id: &str) -> Result<(), QueueError>;
    async fn list_active(&self, now: DateTime<Utc>, stale_threshold: chrono::Duration) -> Result<Vec<Worker>, QueueError>;
}

/// One row to insert when a [`WorkflowRun`] is started — one per
/// [`crate::model::WorkflowStepSpec`] in the run's definition, all created
/// atomically with the run in `Pending` status.
#[derive(Debug, Clone)]
pub struct NewStepRun {
    pub step_key: String,
    pub definition_id: Uuid,
    pub payload: Map<String, Value>,
    pub depends_on: Vec<String>,
}

/// Workflow run progress operations, implemented by
/// `queueforge-orchestrator`, which composes a [`QueueStore`] with these.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create_run(
        &self,
        tenant_id: Uuid,
        workflow_definition_id: Uuid,
        payload: Map<String, Value>,
        priority: i32,
        max_parallel_steps: i32,
        failure_policy: crate::model::FailurePolicy,
        created_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, QueueError>;

    /// Inserts the run's step rows, all starting `Pending`. Called once,
    /// immediately after `create_run`.
    async fn create_step_runs(&self, run_id: Uuid, steps: Vec<NewStepRun>) -> Result<Vec<WorkflowStepRun>, QueueError>;

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, QueueError>;

    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<WorkflowStepRun>, QueueError>;

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: crate::model::WorkflowRunStatus,
        last_error: ErrorUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, QueueError>;

    async fn update_step_status(
        &self,
        step_run_id: Uuid,
        status: crate::model::WorkflowStepStatus,
        child_job_id: Option<Uuid>,
        last_error: ErrorUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkflowStepRun, QueueError>;

    /// Running workflow run ids, oldest `queued_at` first — the order the
    /// reconciler sweeps in (a fairness offset is applied by the caller on
    /// top of this ordering).
    async fn list_running_run_ids(&self, limit: i64) -> Result<Vec<Uuid>, QueueError>;

    /// Per-status run counts for `tenant_id`, the workflow-run analogue of
    /// [`QueueStore::stats`].
    async fn stats(&self, tenant_id: Uuid) -> Result<WorkflowStats, QueueError>;
}

/// Aggregate per-status `WorkflowRun` counters for a tenant, the
/// workflow-run analogue of [`QueueStats`].
#[derive(Debug, Clone, Default)]
pub struct WorkflowStats {
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub canceled: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_object_safe(_: &dyn QueueStore) {}
    fn assert_workflow_store_object_safe(_: &dyn WorkflowStore) {}

    #[test]
    fn traits_are_object_safe() {
        // Compile-time check only: if QueueStore/WorkflowStore ever grew a
        // non-dispatchable method, this module would fail to compile.
        let _ = assert_object_safe;
        let _ = assert_workflow_store_object_safe;
    }
}
