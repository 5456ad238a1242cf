//! Row → domain-type mapping shared by every Postgres store.
//!
//! Enum columns are plain `TEXT` behind a `CHECK` constraint (see
//! `migrations/`), not native Postgres enums, so every enum field is parsed
//! through its `FromStr` impl rather than `sqlx::Type`.

use std::str::FromStr;

use queueforge_core::error::{QueueError, TransientStoreError};
use queueforge_core::model::{
    AttemptStatus, Job, JobAttempt, JobDefinition, JobSource, JobStatus, JobTrigger, TriggerType,
    Worker, WorkflowDefinition, WorkflowRun, WorkflowRunStatus, WorkflowStepRun, WorkflowStepSpec,
    WorkflowStepStatus,
};
use sqlx::postgres::PgRow;
use sqlx::Row;

fn parse_enum<T: FromStr>(raw: &str) -> Result<T, QueueError> {
    T::from_str(raw).map_err(|_| {
        QueueError::TransientStore(TransientStoreError::new(format!(
            "row contained an enum value not recognized by this build: {raw}"
        )))
    })
}

pub fn job_from_row(row: &PgRow) -> Result<Job, QueueError> {
    Ok(Job {
        id: row.try_get("id").map_err(pg_err)?,
        tenant_id: row.try_get("tenant_id").map_err(pg_err)?,
        definition_id: row.try_get("definition_id").map_err(pg_err)?,
        source: parse_enum(row.try_get::<String, _>("source").map_err(pg_err)?.as_str())?,
        source_ref: row.try_get("source_ref").map_err(pg_err)?,
        status: parse_enum(row.try_get::<String, _>("status").map_err(pg_err)?.as_str())?,
        priority: row.try_get("priority").map_err(pg_err)?,
        payload: row.try_get("payload").map_err(pg_err)?,
        dedupe_key: row.try_get("dedupe_key").map_err(pg_err)?,
        correlation_id: row.try_get("correlation_id").map_err(pg_err)?,
        scheduled_for: row.try_get("scheduled_for").map_err(pg_err)?,
        queued_at: row.try_get("queued_at").map_err(pg_err)?,
        started_at: row.try_get("started_at").map_err(pg_err)?,
        finished_at: row.try_get("finished_at").map_err(pg_err)?,
        attempt_count: row.try_get("attempt_count").map_err(pg_err)?,
        max_attempts: row.try_get("max_attempts").map_err(pg_err)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(pg_err)?,
        claimed_by_worker: row.try_get("claimed_by_worker").map_err(pg_err)?,
        last_error: row.try_get("last_error").map_err(pg_err)?,
        created_by: row.try_get("created_by").map_err(pg_err)?,
    })
}

pub fn attempt_from_row(row: &PgRow) -> Result<JobAttempt, QueueError> {
    Ok(JobAttempt {
        id: row.try_get("id").map_err(pg_err)?,
        job_id: row.try_get("job_id").map_err(pg_err)?,
        attempt_no: row.try_get("attempt_no").map_err(pg_err)?,
        worker_id: row.try_get("worker_id").map_err(pg_err)?,
        started_at: row.try_get("started_at").map_err(pg_err)?,
        finished_at: row.try_get("finished_at").map_err(pg_err)?,
        exit_code: row.try_get("exit_code").map_err(pg_err)?,
        status: parse_enum::<AttemptStatus>(row.try_get::<String, _>("status").map_err(pg_err)?.as_str())?,
        stdout_tail: row.try_get("stdout_tail").map_err(pg_err)?,
        stderr_tail: row.try_get("stderr_tail").map_err(pg_err)?,
        error_text: row.try_get("error_text").map_err(pg_err)?,
    })
}

pub fn definition_from_row(row: &PgRow) -> Result<JobDefinition, QueueError> {
    Ok(JobDefinition {
        id: row.try_get("id").map_err(pg_err)?,
        key: row.try_get("key").map_err(pg_err)?,
        description: row.try_get("description").map_err(pg_err)?,
        arg_schema: row.try_get("arg_schema").map_err(pg_err)?,
        timeout_seconds: row.try_get("timeout_seconds").map_err(pg_err)?,
        max_attempts: row.try_get("max_attempts").map_err(pg_err)?,
        is_active: row.try_get("is_active").map_err(pg_err)?,
        created_at: row.try_get("created_at").map_err(pg_err)?,
        updated_at: row.try_get("updated_at").map_err(pg_err)?,
    })
}

pub fn trigger_from_row(row: &PgRow) -> Result<JobTrigger, QueueError> {
    Ok(JobTrigger {
        id: row.try_get("id").map_err(pg_err)?,
        tenant_id: row.try_get("tenant_id").map_err(pg_err)?,
        label: row.try_get("label").map_err(pg_err)?,
        is_enabled: row.try_get("is_enabled").map_err(pg_err)?,
        trigger_type: parse_enum::<TriggerType>(
            row.try_get::<String, _>("trigger_type").map_err(pg_err)?.as_str(),
        )?,
        event_name: row.try_get("event_name").map_err(pg_err)?,
        cron_expr: row.try_get("cron_expr").map_err(pg_err)?,
        timezone: row.try_get("timezone").map_err(pg_err)?,
        definition_id: row.try_get("definition_id").map_err(pg_err)?,
        payload_template: row.try_get("payload_template").map_err(pg_err)?,
        dedupe_window_seconds: row.try_get("dedupe_window_seconds").map_err(pg_err)?,
        created_by: row.try_get("created_by").map_err(pg_err)?,
        created_at: row.try_get("created_at").map_err(pg_err)?,
        updated_at: row.try_get("updated_at").map_err(pg_err)?,
    })
}

pub fn worker_from_row(row: &PgRow) -> Result<Worker, QueueError> {
    Ok(Worker {
        worker_id: row.try_get("worker_id").map_err(pg_err)?,
        hostname: row.try_get("hostname").map_err(pg_err)?,
        version: row.try_get("version").map_err(pg_err)?,
        queues: row.try_get("queues").map_err(pg_err)?,
        last_seen_at: row.try_get("last_seen_at").map_err(pg_err)?,
        running_count: row.try_get("running_count").map_err(pg_err)?,
        metadata: row.try_get("metadata").map_err(pg_err)?,
    })
}

pub fn workflow_definition_from_row(row: &PgRow) -> Result<WorkflowDefinition, QueueError> {
    let steps_json: serde_json::Value = row.try_get("steps").map_err(pg_err)?;
    let steps: Vec<WorkflowStepSpec> = serde_json::from_value(steps_json).map_err(|e| {
        QueueError::TransientStore(TransientStoreError::new(format!("malformed steps column: {e}")))
    })?;
    Ok(WorkflowDefinition {
        id: row.try_get("id").map_err(pg_err)?,
        key: row.try_get("key").map_err(pg_err)?,
        description: row.try_get("description").map_err(pg_err)?,
        steps,
        max_parallel_steps: row.try_get("max_parallel_steps").map_err(pg_err)?,
        failure_policy: parse_enum(row.try_get::<String, _>("failure_policy").map_err(pg_err)?.as_str())?,
        is_active: row.try_get("is_active").map_err(pg_err)?,
        created_at: row.try_get("created_at").map_err(pg_err)?,
        updated_at: row.try_get("updated_at").map_err(pg_err)?,
    })
}

pub fn workflow_run_from_row(row: &PgRow) -> Result<WorkflowRun, QueueError> {
    Ok(WorkflowRun {
        id: row.try_get("id").map_err(pg_err)?,
        tenant_id: row.try_get("tenant_id").map_err(pg_err)?,
        workflow_definition_id: row.try_get("workflow_definition_id").map_err(pg_err)?,
        status: parse_enum::<WorkflowRunStatus>(
            row.try_get::<String, _>("status").map_err(pg_err)?.as_str(),
        )?,
        payload: row.try_get("payload").map_err(pg_err)?,
        priority: row.try_get("priority").map_err(pg_err)?,
        max_parallel_steps: row.try_get("max_parallel_steps").map_err(pg_err)?,
        failure_policy: parse_enum(row.try_get::<String, _>("failure_policy").map_err(pg_err)?.as_str())?,
        queued_at: row.try_get("queued_at").map_err(pg_err)?,
        started_at: row.try_get("started_at").map_err(pg_err)?,
        finished_at: row.try_get("finished_at").map_err(pg_err)?,
        created_by: row.try_get("created_by").map_err(pg_err)?,
        last_error: row.try_get("last_error").map_err(pg_err)?,
    })
}

pub fn workflow_step_run_from_row(row: &PgRow) -> Result<WorkflowStepRun, QueueError> {
    Ok(WorkflowStepRun {
        id: row.try_get("id").map_err(pg_err)?,
        workflow_run_id: row.try_get("workflow_run_id").map_err(pg_err)?,
        step_key: row.try_get("step_key").map_err(pg_err)?,
        definition_id: row.try_get("definition_id").map_err(pg_err)?,
        status: parse_enum::<WorkflowStepStatus>(
            row.try_get::<String, _>("status").map_err(pg_err)?.as_str(),
        )?,
        payload: row.try_get("payload").map_err(pg_err)?,
        depends_on: row.try_get("depends_on").map_err(pg_err)?,
        child_job_id: row.try_get("child_job_id").map_err(pg_err)?,
        queued_at: row.try_get("queued_at").map_err(pg_err)?,
        started_at: row.try_get("started_at").map_err(pg_err)?,
        finished_at: row.try_get("finished_at").map_err(pg_err)?,
        last_error: row.try_get("last_error").map_err(pg_err)?,
    })
}

/// Maps any `sqlx::Error` to our taxonomy's transient bucket. Callers that
/// need to distinguish "not found" or a unique-violation do so before this
/// helper ever sees the error.
pub fn pg_err(err: sqlx::Error) -> QueueError {
    QueueError::TransientStore(TransientStoreError::new(err.to_string()))
}

/// Postgres error code for a unique-constraint violation (used to turn a
/// dedupe-index hit into [`QueueError::DedupConflict`] instead of a
/// transient failure).
pub const UNIQUE_VIOLATION: &str = "23505";

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}
