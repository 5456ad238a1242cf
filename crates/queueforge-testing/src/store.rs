use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use queueforge_core::backoff::BackoffPolicy;
use queueforge_core::error::{InsertOutcome, QueueError};
use queueforge_core::model::{
    AttemptOutcome, AttemptStatus, FailurePolicy, Job, JobAttempt, JobDefinition, JobStatus,
    JobTrigger, Worker, WorkflowDefinition, WorkflowRun, WorkflowRunStatus, WorkflowStepRun,
    WorkflowStepStatus, LAST_ERROR_MAX_BYTES, TAIL_MAX_BYTES, truncate_to_bytes,
};
use queueforge_core::store::{
    CatalogStore, ClaimedJob, CompleteAttempt, CreateTrigger, EnqueueJob, ErrorUpdate, QueueStats,
    QueueStore, TriggerStore, WorkerRegistry, WorkflowStats, WorkflowStore,
};
use uuid::Uuid;

#[derive(Default)]
struct State {
    definitions: HashMap<Uuid, JobDefinition>,
    definitions_by_key: HashMap<String, Uuid>,
    workflow_definitions: HashMap<Uuid, WorkflowDefinition>,
    workflow_definitions_by_key: HashMap<String, Uuid>,
    jobs: HashMap<Uuid, Job>,
    attempts: HashMap<Uuid, JobAttempt>,
    triggers: HashMap<Uuid, JobTrigger>,
    workers: HashMap<String, Worker>,
    runs: HashMap<Uuid, WorkflowRun>,
    step_runs: HashMap<Uuid, WorkflowStepRun>,
}

/// Single in-memory backend implementing every `queueforge_core::store`
/// trait, so a test can wire up an `Orchestrator` or a worker loop without a
/// database.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    backoff: BackoffPolicy,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()), backoff: BackoffPolicy::default() }
    }

    pub fn seed_definition(&self, definition: JobDefinition) -> Uuid {
        let mut state = self.state.lock().unwrap();
        let id = definition.id;
        state.definitions_by_key.insert(definition.key.clone(), id);
        state.definitions.insert(id, definition);
        id
    }

    pub fn seed_workflow_definition(&self, definition: WorkflowDefinition) -> Uuid {
        let mut state = self.state.lock().unwrap();
        let id = definition.id;
        state.workflow_definitions_by_key.insert(definition.key.clone(), id);
        state.workflow_definitions.insert(id, definition);
        id
    }

    fn apply_outcome(
        state: &mut State,
        backoff: &BackoffPolicy,
        mut job: Job,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        exit_code: Option<i32>,
        stdout_tail: Option<String>,
        stderr_tail: Option<String>,
        error_text: Option<String>,
        now: DateTime<Utc>,
    ) -> Job {
        if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
            attempt.finished_at = Some(now);
            attempt.exit_code = exit_code;
            attempt.status = outcome.as_attempt_status();
            attempt.stdout_tail = stdout_tail.map(|t| truncate_to_bytes(&t, TAIL_MAX_BYTES));
            attempt.stderr_tail = stderr_tail.map(|t| truncate_to_bytes(&t, TAIL_MAX_BYTES));
            attempt.error_text = error_text.clone();
        }

        let truncated_error = error_text.as_deref().map(|t| truncate_to_bytes(t, LAST_ERROR_MAX_BYTES));

        match outcome {
            AttemptOutcome::Succeeded => {
                job.status = JobStatus::Succeeded;
                job.finished_at = Some(now);
                job.lease_expires_at = None;
                job.claimed_by_worker = None;
                job.last_error = None;
            }
            AttemptOutcome::Canceled => {
                job.status = JobStatus::Canceled;
                job.finished_at = Some(now);
                job.lease_expires_at = None;
                job.claimed_by_worker = None;
                job.last_error = truncated_error;
            }
            AttemptOutcome::Failed | AttemptOutcome::Timeout => {
                if job.attempt_count < job.max_attempts {
                    let delay = backoff.next_delay(job.attempt_count as u32);
                    job.status = JobStatus::Queued;
                    job.scheduled_for = now + delay;
                    job.started_at = None;
                    job.lease_expires_at = None;
                    job.claimed_by_worker = None;
                    job.last_error = truncated_error;
                } else {
                    job.status = JobStatus::DeadLetter;
                    job.finished_at = Some(now);
                    job.lease_expires_at = None;
                    job.claimed_by_worker = None;
                    job.last_error = truncated_error;
                }
            }
        }

        state.jobs.insert(job.id, job.clone());
        job
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn enqueue(&self, job: EnqueueJob) -> Result<InsertOutcome, QueueError> {
        let mut state = self.state.lock().unwrap();

        if let Some(dedupe_key) = &job.dedupe_key {
            if let Some(existing) = state.jobs.values().find(|existing| {
                existing.tenant_id == job.tenant_id
                    && existing.dedupe_key.as_deref() == Some(dedupe_key.as_str())
                    && existing.status.is_open()
            }) {
                return Ok(InsertOutcome::Deduplicated(existing.clone()));
            }
        }

        let now = Utc::now();
        let new_job = Job {
            id: Uuid::new_v4(),
            tenant_id: job.tenant_id,
            definition_id: job.definition_id,
            source: job.source,
            source_ref: job.source_ref,
            status: JobStatus::Queued,
            priority: job.priority,
            payload: job.payload,
            dedupe_key: job.dedupe_key,
            correlation_id: job.correlation_id,
            scheduled_for: job.scheduled_for,
            queued_at: now,
            started_at: None,
            finished_at: None,
            attempt_count: 0,
            max_attempts: job.max_attempts,
            lease_expires_at: None,
            claimed_by_worker: None,
            last_error: None,
            created_by: job.created_by,
        };
        state.jobs.insert(new_job.id, new_job.clone());
        Ok(InsertOutcome::Created(new_job))
    }

    async fn claim_ready(
        &self,
        worker_id: &str,
        queues: &[String],
        limit: i64,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let wildcard = queues.iter().any(|q| q == "*");

        let mut candidates: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Queued
                    && job.scheduled_for <= now
                    && (wildcard
                        || state
                            .definitions
                            .get(&job.definition_id)
                            .map(|d| queues.iter().any(|q| q == &d.key))
                            .unwrap_or(false))
            })
            .map(|job| job.id)
            .collect();

        candidates.sort_by_key(|id| {
            let job = &state.jobs[id];
            (job.priority, job.scheduled_for, job.queued_at, job.id)
        });
        candidates.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let job = state.jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Running;
            job.claimed_by_worker = Some(worker_id.to_string());
            job.started_at = Some(now);
            job.lease_expires_at = Some(now + lease_duration);
            job.attempt_count += 1;
            let job_snapshot = job.clone();

            let attempt = JobAttempt {
                id: Uuid::new_v4(),
                job_id: job_snapshot.id,
                attempt_no: job_snapshot.attempt_count,
                worker_id: worker_id.to_string(),
                started_at: now,
                finished_at: None,
                exit_code: None,
                status: AttemptStatus::Running,
                stdout_tail: None,
                stderr_tail: None,
                error_text: None,
            };
            state.attempts.insert(attempt.id, attempt.clone());
            claimed.push(ClaimedJob { job: job_snapshot, attempt });
        }

        Ok(claimed)
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str, extend_by: Duration, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::LeaseLost { job_id })?;
        if job.status != JobStatus::Running || job.claimed_by_worker.as_deref() != Some(worker_id) {
            return Err(QueueError::LeaseLost { job_id });
        }
        job.lease_expires_at = Some(now + extend_by);
        Ok(())
    }

    async fn complete_attempt(&self, completion: CompleteAttempt, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get(&completion.job_id)
            .cloned()
            .ok_or(QueueError::LeaseLost { job_id: completion.job_id })?;
        if job.status != JobStatus::Running || job.claimed_by_worker.as_deref() != Some(completion.worker_id.as_str()) {
            return Err(QueueError::LeaseLost { job_id: completion.job_id });
        }

        Ok(Self::apply_outcome(
            &mut state,
            &self.backoff,
            job,
            completion.attempt_id,
            completion.outcome,
            completion.exit_code,
            completion.stdout_tail,
            completion.stderr_tail,
            completion.error_text,
            now,
        ))
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let mut expired: Vec<(Job, Uuid)> = Vec::new();
        for job in state.jobs.values() {
            if job.status == JobStatus::Running && job.lease_expires_at.map(|exp| exp < now).unwrap_or(false) {
                if let Some(attempt) = state
                    .attempts
                    .values()
                    .find(|a| a.job_id == job.id && a.status == AttemptStatus::Running)
                {
                    expired.push((job.clone(), attempt.id));
                }
            }
        }
        expired.truncate(limit.max(0) as usize);

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (job, attempt_id) in expired {
            reclaimed.push(Self::apply_outcome(
                &mut state,
                &self.backoff,
                job,
                attempt_id,
                AttemptOutcome::Timeout,
                None,
                None,
                None,
                Some("lease expired without heartbeat or completion".to_string()),
                now,
            ));
        }
        Ok(reclaimed)
    }

    async fn cancel(&self, job_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(&job_id) else { return Ok(None) };
        if !job.status.is_open() {
            return Ok(None);
        }
        job.status = JobStatus::Canceled;
        job.finished_at = Some(now);
        job.lease_expires_at = None;
        job.claimed_by_worker = None;
        job.last_error = Some(truncate_to_bytes(reason, LAST_ERROR_MAX_BYTES));
        let snapshot = job.clone();

        if let Some(attempt) = state
            .attempts
            .values_mut()
            .find(|a| a.job_id == job_id && a.status == AttemptStatus::Running)
        {
            attempt.status = AttemptStatus::Canceled;
            attempt.finished_at = Some(now);
            attempt.error_text = Some(reason.to_string());
        }

        Ok(Some(snapshot))
    }

    async fn requeue_dead_letter(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::NotFound(format!("dead-letter job {job_id}")))?;
        if job.status != JobStatus::DeadLetter {
            return Err(QueueError::NotFound(format!("dead-letter job {job_id}")));
        }
        job.status = JobStatus::Queued;
        job.scheduled_for = now;
        job.queued_at = now;
        job.started_at = None;
        job.finished_at = None;
        job.attempt_count = 0;
        job.lease_expires_at = None;
        job.claimed_by_worker = None;
        job.last_error = None;
        Ok(job.clone())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, QueueError> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(format!("job {job_id}")))
    }

    async fn stats(&self, tenant_id: Uuid) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().unwrap();
        let mut stats = QueueStats::default();
        for job in state.jobs.values().filter(|j| j.tenant_id == tenant_id) {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::DeadLetter => stats.dead_letter += 1,
                JobStatus::Canceled => stats.canceled += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn get_definition_by_key(&self, key: &str) -> Result<JobDefinition, QueueError> {
        let state = self.state.lock().unwrap();
        let id = state.definitions_by_key.get(key).ok_or_else(|| QueueError::NotFound(format!("job definition {key}")))?;
        Ok(state.definitions[id].clone())
    }

    async fn get_definition_by_id(&self, id: Uuid) -> Result<JobDefinition, QueueError> {
        self.state
            .lock()
            .unwrap()
            .definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(format!("job definition {id}")))
    }

    async fn list_definitions(&self, active_only: bool) -> Result<Vec<JobDefinition>, QueueError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .definitions
            .values()
            .filter(|d| !active_only || d.is_active)
            .cloned()
            .collect())
    }

    async fn get_workflow_definition_by_key(&self, key: &str) -> Result<WorkflowDefinition, QueueError> {
        let state = self.state.lock().unwrap();
        let id = state
            .workflow_definitions_by_key
            .get(key)
            .ok_or_else(|| QueueError::NotFound(format!("workflow definition {key}")))?;
        Ok(state.workflow_definitions[id].clone())
    }

    async fn get_workflow_definition_by_id(&self, id: Uuid) -> Result<WorkflowDefinition, QueueError> {
        self.state
            .lock()
            .unwrap()
            .workflow_definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(format!("workflow definition {id}")))
    }
}

#[async_trait]
impl TriggerStore for InMemoryStore {
    async fn create_trigger(&self, trigger: CreateTrigger) -> Result<JobTrigger, QueueError> {
        let now = Utc::now();
        let created = JobTrigger {
            id: Uuid::new_v4(),
            tenant_id: trigger.tenant_id,
            label: trigger.label,
            is_enabled: true,
            trigger_type: trigger.trigger_type,
            event_name: trigger.event_name,
            cron_expr: trigger.cron_expr,
            timezone: trigger.timezone,
            definition_id: trigger.definition_id,
            payload_template: trigger.payload_template,
            dedupe_window_seconds: trigger.dedupe_window_seconds,
            created_by: trigger.created_by,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().triggers.insert(created.id, created.clone());
        Ok(created)
    }

    async fn set_enabled(&self, trigger_id: Uuid, enabled: bool) -> Result<JobTrigger, QueueError> {
        let mut state = self.state.lock().unwrap();
        let trigger = state
            .triggers
            .get_mut(&trigger_id)
            .ok_or_else(|| QueueError::NotFound(format!("job trigger {trigger_id}")))?;
        trigger.is_enabled = enabled;
        Ok(trigger.clone())
    }

    async fn list_event_triggers(&self, tenant_id: Uuid, event_name: &str) -> Result<Vec<JobTrigger>, QueueError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .triggers
            .values()
            .filter(|t| {
                t.tenant_id == tenant_id
                    && t.is_enabled
                    && t.event_name.as_deref() == Some(event_name)
            })
            .cloned()
            .collect())
    }

    async fn list_schedule_triggers(&self, _due_before: DateTime<Utc>) -> Result<Vec<JobTrigger>, QueueError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .triggers
            .values()
            .filter(|t| t.is_enabled && t.cron_expr.is_some())
            .cloned()
            .collect())
    }

    async fn record_fired(&self, trigger_id: Uuid, fired_at: DateTime<Utc>) -> Result<(), QueueError> {
        if let Some(trigger) = self.state.lock().unwrap().triggers.get_mut(&trigger_id) {
            trigger.updated_at = fired_at;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryStore {
    async fn register(&self, worker: Worker) -> Result<(), QueueError> {
        self.state.lock().unwrap().workers.insert(worker.worker_id.clone(), worker);
        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str, now: DateTime<Utc>, running_count: i32) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| QueueError::NotFound(format!("worker {worker_id}")))?;
        worker.last_seen_at = now;
        worker.running_count = running_count;
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), QueueError> {
        self.state.lock().unwrap().workers.remove(worker_id);
        Ok(())
    }

    async fn list_active(&self, now: DateTime<Utc>, stale_threshold: Duration) -> Result<Vec<Worker>, QueueError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .workers
            .values()
            .filter(|w| !w.is_stale(now, stale_threshold))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn create_run(
        &self,
        tenant_id: Uuid,
        workflow_definition_id: Uuid,
        payload: serde_json::Map<String, serde_json::Value>,
        priority: i32,
        max_parallel_steps: i32,
        failure_policy: FailurePolicy,
        created_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, QueueError> {
        let run = WorkflowRun {
            id: Uuid::new_v4(),
            tenant_id,
            workflow_definition_id,
            status: WorkflowRunStatus::Running,
            payload,
            priority,
            max_parallel_steps,
            failure_policy,
            queued_at: now,
            started_at: Some(now),
            finished_at: None,
            created_by,
            last_error: None,
        };
        self.state.lock().unwrap().runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn create_step_runs(&self, run_id: Uuid, steps: Vec<queueforge_core::store::NewStepRun>) -> Result<Vec<WorkflowStepRun>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let mut created = Vec::with_capacity(steps.len());
        for step in steps {
            let row = WorkflowStepRun {
                id: Uuid::new_v4(),
                workflow_run_id: run_id,
                step_key: step.step_key,
                definition_id: step.definition_id,
                status: WorkflowStepStatus::Pending,
                payload: step.payload,
                depends_on: step.depends_on,
                child_job_id: None,
                queued_at: None,
                started_at: None,
                finished_at: None,
                last_error: None,
            };
            state.step_runs.insert(row.id, row.clone());
            created.push(row);
        }
        Ok(created)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, QueueError> {
        self.state
            .lock()
            .unwrap()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(format!("workflow run {run_id}")))
    }

    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<WorkflowStepRun>, QueueError> {
        let mut steps: Vec<WorkflowStepRun> = self
            .state
            .lock()
            .unwrap()
            .step_runs
            .values()
            .filter(|s| s.workflow_run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.step_key.cmp(&b.step_key));
        Ok(steps)
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: WorkflowRunStatus,
        last_error: ErrorUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, QueueError> {
        let mut state = self.state.lock().unwrap();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| QueueError::NotFound(format!("workflow run {run_id}")))?;
        run.status = status;
        match last_error {
            ErrorUpdate::Keep => {}
            ErrorUpdate::Clear => run.last_error = None,
            ErrorUpdate::Set(e) => run.last_error = Some(e),
        }
        if status.is_terminal() {
            run.finished_at.get_or_insert(now);
        } else {
            run.finished_at = None;
        }
        Ok(run.clone())
    }

    async fn update_step_status(
        &self,
        step_run_id: Uuid,
        status: WorkflowStepStatus,
        child_job_id: Option<Uuid>,
        last_error: ErrorUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkflowStepRun, QueueError> {
        let mut state = self.state.lock().unwrap();
        let step = state
            .step_runs
            .get_mut(&step_run_id)
            .ok_or_else(|| QueueError::NotFound(format!("workflow step run {step_run_id}")))?;
        step.status = status;
        if child_job_id.is_some() {
            step.child_job_id = child_job_id;
        }
        match last_error {
            ErrorUpdate::Keep => {}
            ErrorUpdate::Clear => step.last_error = None,
            ErrorUpdate::Set(e) => step.last_error = Some(e),
        }
        match status {
            WorkflowStepStatus::Queued => {
                step.queued_at.get_or_insert(now);
            }
            WorkflowStepStatus::Running => {
                step.started_at.get_or_insert(now);
            }
            other if other.is_terminal() => {
                step.finished_at.get_or_insert(now);
            }
            _ => {}
        }
        Ok(step.clone())
    }

    async fn list_running_run_ids(&self, limit: i64) -> Result<Vec<Uuid>, QueueError> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<&WorkflowRun> = state.runs.values().filter(|r| r.status == WorkflowRunStatus::Running).collect();
        runs.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then(a.id.cmp(&b.id)));
        Ok(runs.into_iter().take(limit.max(0) as usize).map(|r| r.id).collect())
    }

    async fn stats(&self, tenant_id: Uuid) -> Result<WorkflowStats, QueueError> {
        let state = self.state.lock().unwrap();
        let mut stats = WorkflowStats::default();
        for run in state.runs.values().filter(|r| r.tenant_id == tenant_id) {
            match run.status {
                WorkflowRunStatus::Running => stats.running += 1,
                WorkflowRunStatus::Succeeded => stats.succeeded += 1,
                WorkflowRunStatus::Failed => stats.failed += 1,
                WorkflowRunStatus::Canceled => stats.canceled += 1,
            }
        }
        Ok(stats)
    }
}
