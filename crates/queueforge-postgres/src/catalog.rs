//! Postgres-backed [`CatalogStore`].
//!
//! Definitions are read-mostly, so `get_definition_by_key` is fronted by a
//! short-TTL in-process cache keyed by `key`, using `dashmap`'s concurrent
//! map for process-local state. A write (none exposed on this trait today,
//! but future catalog-admin operations would) must invalidate the entry; a
//! stale read is tolerated for at most `cache_ttl` because the store itself
//! is always the authority at mutation time.

use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use queueforge_core::error::QueueError;
use queueforge_core::model::{JobDefinition, WorkflowDefinition};
use queueforge_core::store::CatalogStore;
use sqlx::PgPool;
use uuid::Uuid;

use crate::rows::{definition_from_row, pg_err, workflow_definition_from_row};

const DEFAULT_CACHE_TTL: StdDuration = StdDuration::from_secs(60);

struct CacheEntry {
    definition: JobDefinition,
    inserted_at: Instant,
}

pub struct PgCatalogStore {
    pool: PgPool,
    cache_ttl: StdDuration,
    by_key: DashMap<String, CacheEntry>,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, cache_ttl: DEFAULT_CACHE_TTL, by_key: DashMap::new() }
    }

    pub fn with_cache_ttl(pool: PgPool, cache_ttl: StdDuration) -> Self {
        Self { pool, cache_ttl, by_key: DashMap::new() }
    }

    fn cached(&self, key: &str) -> Option<JobDefinition> {
        let entry = self.by_key.get(key)?;
        if entry.inserted_at.elapsed() > self.cache_ttl {
            return None;
        }
        Some(entry.definition.clone())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn get_definition_by_key(&self, key: &str) -> Result<JobDefinition, QueueError> {
        if let Some(definition) = self.cached(key) {
            return Ok(definition);
        }

        let row = sqlx::query("SELECT * FROM job_definitions WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;

        let row = row.ok_or_else(|| QueueError::NotFound(format!("job definition {key}")))?;
        let definition = definition_from_row(&row)?;
        self.by_key.insert(
            key.to_string(),
            CacheEntry { definition: definition.clone(), inserted_at: Instant::now() },
        );
        Ok(definition)
    }

    async fn get_definition_by_id(&self, id: Uuid) -> Result<JobDefinition, QueueError> {
        let row = sqlx::query("SELECT * FROM job_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;

        match row {
            Some(row) => definition_from_row(&row),
            None => Err(QueueError::NotFound(format!("job definition {id}"))),
        }
    }

    async fn list_definitions(&self, active_only: bool) -> Result<Vec<JobDefinition>, QueueError> {
        let rows = if active_only {
            sqlx::query("SELECT * FROM job_definitions WHERE is_active ORDER BY key")
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("SELECT * FROM job_definitions ORDER BY key")
                .fetch_all(&self.pool)
                .await
        }
        .map_err(pg_err)?;

        rows.iter().map(definition_from_row).collect()
    }

    async fn get_workflow_definition_by_key(&self, key: &str) -> Result<WorkflowDefinition, QueueError> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;

        match row {
            Some(row) => workflow_definition_from_row(&row),
            None => Err(QueueError::NotFound(format!("workflow definition {key}"))),
        }
    }

    async fn get_workflow_definition_by_id(&self, id: Uuid) -> Result<WorkflowDefinition, QueueError> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;

        match row {
            Some(row) => workflow_definition_from_row(&row),
            None => Err(QueueError::NotFound(format!("workflow definition {id}"))),
        }
    }
}

/// Inserts a job definition directly, bypassing any admin API — used by
/// integration tests and local seeding scripts.
pub async fn seed_definition(pool: &PgPool, key: &str, arg_schema: serde_json::Value) -> Result<Uuid, QueueError> {
    sqlx::query_scalar("INSERT INTO job_definitions (key, arg_schema) VALUES ($1, $2) RETURNING id")
        .bind(key)
        .bind(arg_schema)
        .fetch_one(pool)
        .await
        .map_err(pg_err)
}

/// Inserts a workflow definition directly; `steps` must already match
/// [`queueforge_core::model::WorkflowStepSpec`]'s JSON shape.
pub async fn seed_workflow(pool: &PgPool, key: &str, steps: serde_json::Value) -> Result<Uuid, QueueError> {
    sqlx::query_scalar("INSERT INTO workflow_definitions (key, steps) VALUES ($1, $2) RETURNING id")
        .bind(key)
        .bind(steps)
        .fetch_one(pool)
        .await
        .map_err(pg_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "./migrations")]
    async fn caches_definition_lookups(pool: PgPool) -> sqlx::Result<()> {
        seed_definition(&pool, "extract-frames", serde_json::json!({}))
            .await
            .unwrap();
        let store = PgCatalogStore::new(pool);

        let first = store.get_definition_by_key("extract-frames").await.unwrap();
        let second = store.get_definition_by_key("extract-frames").await.unwrap();
        assert_eq!(first.id, second.id);

        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn missing_definition_is_not_found(pool: PgPool) -> sqlx::Result<()> {
        let store = PgCatalogStore::new(pool);
        assert!(matches!(
            store.get_definition_by_key("does-not-exist").await,
            Err(QueueError::NotFound(_))
        ));
        Ok(())
    }
}
