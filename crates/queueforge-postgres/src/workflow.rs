//! Workflow run/step-run persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queueforge_core::error::QueueError;
use queueforge_core::model::{FailurePolicy, WorkflowRun, WorkflowRunStatus, WorkflowStepRun, WorkflowStepStatus};
use queueforge_core::store::{ErrorUpdate, NewStepRun, WorkflowStats, WorkflowStore};
use sqlx::PgPool;
use uuid::Uuid;

use crate::rows::{pg_err, workflow_run_from_row, workflow_step_run_from_row};

pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
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
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (tenant_id, workflow_definition_id, status, payload, priority,
                 max_parallel_steps, failure_policy, queued_at, started_at, created_by)
            VALUES ($1, $2, 'running', $3, $4, $5, $6, $7, $7, $8)
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(workflow_definition_id)
        .bind(serde_json::Value::Object(payload))
        .bind(priority)
        .bind(max_parallel_steps)
        .bind(failure_policy.as_str())
        .bind(now)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;
        workflow_run_from_row(&row)
    }

    async fn create_step_runs(&self, run_id: Uuid, steps: Vec<NewStepRun>) -> Result<Vec<WorkflowStepRun>, QueueError> {
        let mut created = Vec::with_capacity(steps.len());
        for step in steps {
            let row = sqlx::query(
                r#"
                INSERT INTO workflow_step_runs
                    (workflow_run_id, step_key, definition_id, status, payload, depends_on)
                VALUES ($1, $2, $3, 'pending', $4, $5)
                RETURNING *
                "#,
            )
            .bind(run_id)
            .bind(&step.step_key)
            .bind(step.definition_id)
            .bind(serde_json::Value::Object(step.payload))
            .bind(&step.depends_on)
            .fetch_one(&self.pool)
            .await
            .map_err(pg_err)?;
            created.push(workflow_step_run_from_row(&row)?);
        }
        Ok(created)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, QueueError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?
            .ok_or_else(|| QueueError::NotFound(format!("workflow run {run_id}")))?;
        workflow_run_from_row(&row)
    }

    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<WorkflowStepRun>, QueueError> {
        let rows = sqlx::query("SELECT * FROM workflow_step_runs WHERE workflow_run_id = $1 ORDER BY step_key ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;
        rows.iter().map(workflow_step_run_from_row).collect()
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: WorkflowRunStatus,
        last_error: ErrorUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, QueueError> {
        let finished_at = status.is_terminal().then_some(now);
        let (clear_error, set_error) = split_error_update(last_error);
        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2,
                last_error = CASE WHEN $3 THEN NULL ELSE COALESCE($4, last_error) END,
                finished_at = CASE WHEN $5 THEN COALESCE(finished_at, $6) ELSE NULL END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(clear_error)
        .bind(&set_error)
        .bind(status.is_terminal())
        .bind(finished_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?
        .ok_or_else(|| QueueError::NotFound(format!("workflow run {run_id}")))?;
        workflow_run_from_row(&row)
    }

    async fn update_step_status(
        &self,
        step_run_id: Uuid,
        status: WorkflowStepStatus,
        child_job_id: Option<Uuid>,
        last_error: ErrorUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkflowStepRun, QueueError> {
        let queued_at = (status == WorkflowStepStatus::Queued).then_some(now);
        let started_at = (status == WorkflowStepStatus::Running).then_some(now);
        let finished_at = status.is_terminal().then_some(now);
        let (clear_error, set_error) = split_error_update(last_error);
        let row = sqlx::query(
            r#"
            UPDATE workflow_step_runs
            SET status = $2,
                child_job_id = COALESCE($3, child_job_id),
                last_error = CASE WHEN $4 THEN NULL ELSE COALESCE($5, last_error) END,
                queued_at = COALESCE(queued_at, $6),
                started_at = COALESCE(started_at, $7),
                finished_at = COALESCE(finished_at, $8)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(step_run_id)
        .bind(status.as_str())
        .bind(child_job_id)
        .bind(clear_error)
        .bind(&set_error)
        .bind(queued_at)
        .bind(started_at)
        .bind(finished_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?
        .ok_or_else(|| QueueError::NotFound(format!("workflow step run {step_run_id}")))?;
        workflow_step_run_from_row(&row)
    }

    async fn list_running_run_ids(&self, limit: i64) -> Result<Vec<Uuid>, QueueError> {
        let rows = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM workflow_runs WHERE status = 'running' ORDER BY queued_at ASC, id ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(rows)
    }

    async fn stats(&self, tenant_id: Uuid) -> Result<WorkflowStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'canceled') AS canceled
            FROM workflow_runs
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        use sqlx::Row;
        Ok(WorkflowStats {
            running: row.try_get("running").map_err(pg_err)?,
            succeeded: row.try_get("succeeded").map_err(pg_err)?,
            failed: row.try_get("failed").map_err(pg_err)?,
            canceled: row.try_get("canceled").map_err(pg_err)?,
        })
    }
}

/// Splits an [`ErrorUpdate`] into the two bind parameters the `CASE WHEN`
/// clauses above need: a `clear` flag and the value to set when not
/// clearing (a `Keep` yields `(false, None)`, leaving the column alone via
/// `COALESCE`).
fn split_error_update(update: ErrorUpdate) -> (bool, Option<String>) {
    match update {
        ErrorUpdate::Keep => (false, None),
        ErrorUpdate::Clear => (true, None),
        ErrorUpdate::Set(s) => (false, Some(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{seed_definition, seed_workflow};
    use queueforge_core::model::WorkflowStepSpec;
    use serde_json::{json, Map};

    #[sqlx::test(migrations = "./migrations")]
    async fn creates_a_run_with_step_rows(pool: PgPool) -> sqlx::Result<()> {
        let store = PgWorkflowStore::new(pool.clone());
        let a_id = seed_definition(&pool, "a_def", json!({})).await.unwrap();
        let steps = vec![WorkflowStepSpec {
            step_key: "a".into(),
            definition_key: "a_def".into(),
            depends_on: vec![],
            payload: Map::new(),
        }];
        let workflow_id = seed_workflow(&pool, "two_step", serde_json::to_value(&steps).unwrap())
            .await
            .unwrap();

        let run = store
            .create_run(
                Uuid::new_v4(),
                workflow_id,
                Map::new(),
                100,
                2,
                FailurePolicy::FailFast,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Running);

        let steps = store
            .create_step_runs(
                run.id,
                vec![NewStepRun {
                    step_key: "a".into(),
                    definition_id: a_id,
                    payload: Map::new(),
                    depends_on: vec![],
                }],
            )
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, WorkflowStepStatus::Pending);

        let listed = store.list_step_runs(run.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn update_run_status_sets_finished_at_once(pool: PgPool) -> sqlx::Result<()> {
        let store = PgWorkflowStore::new(pool.clone());
        let workflow_id = seed_workflow(&pool, "empty_workflow", json!([])).await.unwrap();
        let run = store
            .create_run(Uuid::new_v4(), workflow_id, Map::new(), 100, 1, FailurePolicy::FailFast, None, Utc::now())
            .await
            .unwrap();

        let now = Utc::now();
        let updated = store.update_run_status(run.id, WorkflowRunStatus::Succeeded, ErrorUpdate::Clear, now).await.unwrap();
        assert_eq!(updated.finished_at, Some(now));

        let later = now + chrono::Duration::seconds(5);
        let updated_again = store
            .update_run_status(run.id, WorkflowRunStatus::Succeeded, ErrorUpdate::Keep, later)
            .await
            .unwrap();
        assert_eq!(updated_again.finished_at, Some(now));
        Ok(())
    }
}
