//! Postgres-backed [`WorkerRegistry`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queueforge_core::error::QueueError;
use queueforge_core::model::Worker;
use queueforge_core::store::WorkerRegistry;
use sqlx::PgPool;

use crate::rows::{pg_err, worker_from_row};

pub struct PgWorkerRegistry {
    pool: PgPool,
}

impl PgWorkerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRegistry for PgWorkerRegistry {
    async fn register(&self, worker: Worker) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO job_workers (worker_id, hostname, version, queues, last_seen_at, running_count, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (worker_id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                version = EXCLUDED.version,
                queues = EXCLUDED.queues,
                last_seen_at = EXCLUDED.last_seen_at,
                running_count = EXCLUDED.running_count,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&worker.worker_id)
        .bind(&worker.hostname)
        .bind(&worker.version)
        .bind(&worker.queues)
        .bind(worker.last_seen_at)
        .bind(worker.running_count)
        .bind(&worker.metadata)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str, now: DateTime<Utc>, running_count: i32) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE job_workers SET last_seen_at = $1, running_count = $2 WHERE worker_id = $3",
        )
        .bind(now)
        .bind(running_count)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(format!("worker {worker_id}")));
        }
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM job_workers WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn list_active(&self, now: DateTime<Utc>, stale_threshold: chrono::Duration) -> Result<Vec<Worker>, QueueError> {
        let cutoff = now - stale_threshold;
        let rows = sqlx::query("SELECT * FROM job_workers WHERE last_seen_at >= $1 ORDER BY worker_id")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;

        rows.iter().map(worker_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[sqlx::test(migrations = "./migrations")]
    async fn registers_and_lists_active_workers(pool: PgPool) -> sqlx::Result<()> {
        let registry = PgWorkerRegistry::new(pool);
        registry
            .register(Worker {
                worker_id: "worker-1".to_string(),
                hostname: "host-a".to_string(),
                version: "1.0.0".to_string(),
                queues: vec!["*".to_string()],
                last_seen_at: Utc::now(),
                running_count: 0,
                metadata: Map::new(),
            })
            .await
            .unwrap();

        let active = registry.list_active(Utc::now(), chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(active.len(), 1);

        Ok(())
    }
}
