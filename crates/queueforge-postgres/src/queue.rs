//! Postgres-backed [`QueueStore`].
//!
//! `claim_ready` claims with `FOR UPDATE SKIP LOCKED` so concurrent workers
//! never block each other on the same batch, `complete_attempt` applies the
//! exponential-backoff-then-dead-letter transition, and `reclaim_expired`
//! sweeps leases abandoned by a crashed worker. Dedupe is scoped per tenant
//! and definition, queue selection is a filter over the claim query, and
//! every attempt is recorded in a separate `job_attempts` audit trail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queueforge_core::backoff::BackoffPolicy;
use queueforge_core::error::{InsertOutcome, QueueError};
use queueforge_core::model::{AttemptOutcome, AttemptStatus, Job, JobAttempt, LAST_ERROR_MAX_BYTES, TAIL_MAX_BYTES, truncate_to_bytes};
use queueforge_core::store::{ClaimedJob, CompleteAttempt, EnqueueJob, QueueStats, QueueStore};
use sqlx::PgPool;
use uuid::Uuid;

use crate::rows::{attempt_from_row, is_unique_violation, job_from_row, pg_err};

/// Connection pool plus the retry schedule applied to `Failed`/`Timeout`
/// attempts. One instance is shared across a process (it is `Clone`, since
/// `PgPool` itself is a handle).
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, backoff: BackoffPolicy::default() }
    }

    pub fn with_backoff(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies a completion outcome to a job's open attempt and row,
    /// without checking which worker currently owns the lease. Used both by
    /// `complete_attempt` (after the caller has verified ownership) and by
    /// `reclaim_expired` (where the claiming worker is gone by definition).
    async fn apply_outcome(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &Job,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        exit_code: Option<i32>,
        stdout_tail: Option<String>,
        stderr_tail: Option<String>,
        error_text: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let attempt_status: AttemptStatus = outcome.as_attempt_status();
        sqlx::query(
            r#"
            UPDATE job_attempts
            SET finished_at = $1,
                exit_code = $2,
                status = $3,
                stdout_tail = $4,
                stderr_tail = $5,
                error_text = $6
            WHERE id = $7
            "#,
        )
        .bind(now)
        .bind(exit_code)
        .bind(attempt_status.as_str())
        .bind(stdout_tail.map(|t| truncate_to_bytes(&t, TAIL_MAX_BYTES)))
        .bind(stderr_tail.map(|t| truncate_to_bytes(&t, TAIL_MAX_BYTES)))
        .bind(error_text.as_deref())
        .bind(attempt_id)
        .execute(&mut **tx)
        .await
        .map_err(pg_err)?;

        let truncated_error = error_text.as_deref().map(|t| truncate_to_bytes(t, LAST_ERROR_MAX_BYTES));

        let row = match outcome {
            AttemptOutcome::Succeeded => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'succeeded',
                        finished_at = $1,
                        lease_expires_at = NULL,
                        claimed_by_worker = NULL,
                        last_error = NULL
                    WHERE id = $2
                    RETURNING *
                    "#,
                )
                .bind(now)
                .bind(job.id)
                .fetch_one(&mut **tx)
                .await
                .map_err(pg_err)?
            }
            AttemptOutcome::Canceled => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'canceled',
                        finished_at = $1,
                        lease_expires_at = NULL,
                        claimed_by_worker = NULL,
                        last_error = $2
                    WHERE id = $3
                    RETURNING *
                    "#,
                )
                .bind(now)
                .bind(truncated_error.as_deref())
                .bind(job.id)
                .fetch_one(&mut **tx)
                .await
                .map_err(pg_err)?
            }
            AttemptOutcome::Failed | AttemptOutcome::Timeout => {
                if job.attempt_count < job.max_attempts {
                    let delay = self.backoff.next_delay(job.attempt_count as u32);
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'queued',
                            scheduled_for = $1,
                            started_at = NULL,
                            lease_expires_at = NULL,
                            claimed_by_worker = NULL,
                            last_error = $2
                        WHERE id = $3
                        RETURNING *
                        "#,
                    )
                    .bind(now + delay)
                    .bind(truncated_error.as_deref())
                    .bind(job.id)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(pg_err)?
                } else {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'dead_letter',
                            finished_at = $1,
                            lease_expires_at = NULL,
                            claimed_by_worker = NULL,
                            last_error = $2
                        WHERE id = $3
                        RETURNING *
                        "#,
                    )
                    .bind(now)
                    .bind(truncated_error.as_deref())
                    .bind(job.id)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(pg_err)?
                }
            }
        };

        job_from_row(&row)
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(&self, job: EnqueueJob) -> Result<InsertOutcome, QueueError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                tenant_id, definition_id, source, source_ref, priority, payload,
                dedupe_key, correlation_id, scheduled_for, queued_at, max_attempts, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), $10, $11)
            RETURNING *
            "#,
        )
        .bind(job.tenant_id)
        .bind(job.definition_id)
        .bind(job.source.as_str())
        .bind(&job.source_ref)
        .bind(job.priority)
        .bind(&job.payload)
        .bind(&job.dedupe_key)
        .bind(&job.correlation_id)
        .bind(job.scheduled_for)
        .bind(job.max_attempts)
        .bind(job.created_by)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(InsertOutcome::Created(job_from_row(&row)?)),
            Err(e) if is_unique_violation(&e) => {
                let dedupe_key = job.dedupe_key.as_deref().unwrap_or_default();
                let row = sqlx::query(
                    r#"
                    SELECT * FROM jobs
                    WHERE tenant_id = $1 AND dedupe_key = $2 AND status IN ('queued', 'running')
                    "#,
                )
                .bind(job.tenant_id)
                .bind(dedupe_key)
                .fetch_one(&self.pool)
                .await
                .map_err(pg_err)?;
                Ok(InsertOutcome::Deduplicated(job_from_row(&row)?))
            }
            Err(e) => Err(pg_err(e)),
        }
    }

    async fn claim_ready(
        &self,
        worker_id: &str,
        queues: &[String],
        limit: i64,
        lease_duration: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, QueueError> {
        let wildcard = queues.iter().any(|q| q == "*");
        let lease_expires_at = now + lease_duration;

        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT j.id
                FROM jobs j
                JOIN job_definitions d ON d.id = j.definition_id
                WHERE j.status = 'queued'
                  AND j.scheduled_for <= $1
                  AND ($2 OR d.key = ANY($3))
                ORDER BY j.priority ASC, j.scheduled_for ASC, j.queued_at ASC, j.id ASC
                LIMIT $4
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                claimed_by_worker = $5,
                started_at = $1,
                lease_expires_at = $6,
                attempt_count = attempt_count + 1
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(wildcard)
        .bind(queues)
        .bind(limit)
        .bind(worker_id)
        .bind(lease_expires_at)
        .fetch_all(&mut *tx)
        .await
        .map_err(pg_err)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let job = job_from_row(row)?;
            let attempt_row = sqlx::query(
                r#"
                INSERT INTO job_attempts (job_id, attempt_no, worker_id, started_at, status)
                VALUES ($1, $2, $3, $4, 'running')
                RETURNING *
                "#,
            )
            .bind(job.id)
            .bind(job.attempt_count)
            .bind(worker_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(pg_err)?;
            let attempt: JobAttempt = attempt_from_row(&attempt_row)?;
            claimed.push(ClaimedJob { job, attempt });
        }

        tx.commit().await.map_err(pg_err)?;
        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        extend_by: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $1
            WHERE id = $2 AND claimed_by_worker = $3 AND status = 'running'
            "#,
        )
        .bind(now + extend_by)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost { job_id });
        }
        Ok(())
    }

    async fn complete_attempt(&self, completion: CompleteAttempt, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let row = sqlx::query(
            r#"SELECT * FROM jobs WHERE id = $1 AND claimed_by_worker = $2 AND status = 'running' FOR UPDATE"#,
        )
        .bind(completion.job_id)
        .bind(&completion.worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(pg_err)?;

        let Some(row) = row else {
            return Err(QueueError::LeaseLost { job_id: completion.job_id });
        };
        let job = job_from_row(&row)?;

        let updated = self
            .apply_outcome(
                &mut tx,
                &job,
                completion.attempt_id,
                completion.outcome,
                completion.exit_code,
                completion.stdout_tail,
                completion.stderr_tail,
                completion.error_text,
                now,
            )
            .await?;

        tx.commit().await.map_err(pg_err)?;
        Ok(updated)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, QueueError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let expired = sqlx::query(
            r#"
            SELECT j.*, a.id AS attempt_id
            FROM jobs j
            JOIN job_attempts a ON a.job_id = j.id AND a.status = 'running'
            WHERE j.status = 'running' AND j.lease_expires_at < $1
            ORDER BY j.lease_expires_at ASC
            LIMIT $2
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(pg_err)?;

        let mut reclaimed = Vec::with_capacity(expired.len());
        for row in &expired {
            let job = job_from_row(row)?;
            let attempt_id: Uuid = sqlx::Row::try_get(row, "attempt_id").map_err(pg_err)?;
            let updated = self
                .apply_outcome(
                    &mut tx,
                    &job,
                    attempt_id,
                    AttemptOutcome::Timeout,
                    None,
                    None,
                    None,
                    Some("lease expired without heartbeat or completion".to_string()),
                    now,
                )
                .await?;
            reclaimed.push(updated);
        }

        tx.commit().await.map_err(pg_err)?;
        Ok(reclaimed)
    }

    async fn cancel(&self, job_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'canceled',
                finished_at = $1,
                lease_expires_at = NULL,
                claimed_by_worker = NULL,
                last_error = $2
            WHERE id = $3 AND status IN ('queued', 'running')
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(truncate_to_bytes(reason, LAST_ERROR_MAX_BYTES))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(pg_err)?;

        let Some(row) = row else {
            tx.commit().await.map_err(pg_err)?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE job_attempts
            SET status = 'canceled', finished_at = $1, error_text = $2
            WHERE job_id = $3 AND status = 'running'
            "#,
        )
        .bind(now)
        .bind(reason)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(pg_err)?;

        tx.commit().await.map_err(pg_err)?;
        Ok(Some(job_from_row(&row)?))
    }

    async fn requeue_dead_letter(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                scheduled_for = $1,
                queued_at = $1,
                started_at = NULL,
                finished_at = NULL,
                attempt_count = 0,
                lease_expires_at = NULL,
                claimed_by_worker = NULL,
                last_error = NULL
            WHERE id = $2 AND status = 'dead_letter'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(QueueError::NotFound(format!("dead-letter job {job_id}"))),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(QueueError::NotFound(format!("job {job_id}"))),
        }
    }

    async fn stats(&self, tenant_id: Uuid) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'dead_letter') AS dead_letter,
                COUNT(*) FILTER (WHERE status = 'canceled') AS canceled
            FROM jobs
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        use sqlx::Row;
        Ok(QueueStats {
            queued: row.try_get("queued").map_err(pg_err)?,
            running: row.try_get("running").map_err(pg_err)?,
            succeeded: row.try_get("succeeded").map_err(pg_err)?,
            failed: row.try_get("failed").map_err(pg_err)?,
            dead_letter: row.try_get("dead_letter").map_err(pg_err)?,
            canceled: row.try_get("canceled").map_err(pg_err)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "./migrations")]
    async fn enqueue_then_claim_round_trips(pool: PgPool) -> sqlx::Result<()> {
        let store = PgQueueStore::new(pool.clone());
        let tenant_id = Uuid::new_v4();
        let definition_id = seed_definition(&pool, "noop").await;

        let outcome = store
            .enqueue(EnqueueJob {
                tenant_id,
                definition_id,
                source: queueforge_core::model::JobSource::Manual,
                source_ref: None,
                priority: 100,
                payload: serde_json::Map::new(),
                dedupe_key: None,
                correlation_id: None,
                scheduled_for: Utc::now(),
                max_attempts: 3,
                created_by: None,
            })
            .await
            .unwrap();
        assert!(!outcome.was_deduplicated());

        let claimed = store
            .claim_ready(
                "worker-1",
                &["*".to_string()],
                10,
                chrono::Duration::seconds(60),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.id, outcome.job().id);
        assert_eq!(claimed[0].attempt.attempt_no, 1);

        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn dedupe_key_collision_returns_existing_job(pool: PgPool) -> sqlx::Result<()> {
        let store = PgQueueStore::new(pool.clone());
        let tenant_id = Uuid::new_v4();
        let definition_id = seed_definition(&pool, "sync").await;

        let make_job = || EnqueueJob {
            tenant_id,
            definition_id,
            source: queueforge_core::model::JobSource::Event,
            source_ref: None,
            priority: 100,
            payload: serde_json::Map::new(),
            dedupe_key: Some("sync:acme".to_string()),
            correlation_id: None,
            scheduled_for: Utc::now(),
            max_attempts: 3,
            created_by: None,
        };

        let first = store.enqueue(make_job()).await.unwrap();
        let second = store.enqueue(make_job()).await.unwrap();
        assert!(!first.was_deduplicated());
        assert!(second.was_deduplicated());
        assert_eq!(first.job().id, second.job().id);

        Ok(())
    }

    async fn seed_definition(pool: &PgPool, key: &str) -> Uuid {
        sqlx::query_scalar("INSERT INTO job_definitions (key) VALUES ($1) RETURNING id")
            .bind(key)
            .fetch_one(pool)
            .await
            .unwrap()
    }
}
