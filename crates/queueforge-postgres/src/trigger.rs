//! Postgres-backed [`TriggerStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queueforge_core::error::QueueError;
use queueforge_core::model::JobTrigger;
use queueforge_core::store::{CreateTrigger, TriggerStore};
use sqlx::PgPool;
use uuid::Uuid;

use crate::rows::{pg_err, trigger_from_row};

pub struct PgTriggerStore {
    pool: PgPool,
}

impl PgTriggerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerStore for PgTriggerStore {
    async fn create_trigger(&self, trigger: CreateTrigger) -> Result<JobTrigger, QueueError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_triggers (
                tenant_id, label, trigger_type, event_name, cron_expr, timezone,
                definition_id, payload_template, dedupe_window_seconds, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(trigger.tenant_id)
        .bind(&trigger.label)
        .bind(trigger.trigger_type.as_str())
        .bind(&trigger.event_name)
        .bind(&trigger.cron_expr)
        .bind(&trigger.timezone)
        .bind(trigger.definition_id)
        .bind(&trigger.payload_template)
        .bind(trigger.dedupe_window_seconds)
        .bind(trigger.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        trigger_from_row(&row)
    }

    async fn set_enabled(&self, trigger_id: Uuid, enabled: bool) -> Result<JobTrigger, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE job_triggers SET is_enabled = $1, updated_at = now() WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(enabled)
        .bind(trigger_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        match row {
            Some(row) => trigger_from_row(&row),
            None => Err(QueueError::NotFound(format!("job trigger {trigger_id}"))),
        }
    }

    async fn list_event_triggers(&self, tenant_id: Uuid, event_name: &str) -> Result<Vec<JobTrigger>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM job_triggers
            WHERE tenant_id = $1 AND trigger_type = 'event' AND event_name = $2 AND is_enabled
            "#,
        )
        .bind(tenant_id)
        .bind(event_name)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        rows.iter().map(trigger_from_row).collect()
    }

    async fn list_schedule_triggers(&self, due_before: DateTime<Utc>) -> Result<Vec<JobTrigger>, QueueError> {
        // Schedule triggers don't carry their own "next fire" column here —
        // the trigger engine (`queueforge-runtime::trigger`) evaluates each
        // enabled trigger's cron expression against its own last-fired
        // bookkeeping. `due_before` narrows nothing at the SQL layer; it is
        // accepted for symmetry with `list_event_triggers` and to let a
        // future "next_fire_at" column be added without a trait change.
        let _ = due_before;
        let rows = sqlx::query(
            r#"SELECT * FROM job_triggers WHERE trigger_type = 'schedule' AND is_enabled"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        rows.iter().map(trigger_from_row).collect()
    }

    async fn record_fired(&self, trigger_id: Uuid, fired_at: DateTime<Utc>) -> Result<(), QueueError> {
        sqlx::query("UPDATE job_triggers SET updated_at = $1 WHERE id = $2")
            .bind(fired_at)
            .bind(trigger_id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(())
    }
}
