//! PostgreSQL implementation of the queueforge storage traits.
//!
//! This crate implements [`queueforge_core::store::QueueStore`],
//! [`queueforge_core::store::CatalogStore`],
//! [`queueforge_core::store::TriggerStore`],
//! [`queueforge_core::store::WorkerRegistry`], and
//! [`queueforge_core::store::WorkflowStore`] against the schema in
//! `migrations/`, transliterated from the original job/workflow queue
//! migrations.
//!
//! # Features
//!
//! - Row-level claim with `FOR UPDATE SKIP LOCKED`
//! - Exponential backoff with jitter on retry
//! - Dead-letter queue for permanently failed jobs
//! - Worker heartbeats and lease-based reclaim of abandoned jobs
//! - Multi-tenant dedupe via a partial unique index
//!
//! # Usage
//!
//! ```rust,ignore
//! use queueforge_postgres::PgQueueStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/queueforge").await?;
//! let store = PgQueueStore::new(pool);
//! ```

mod catalog;
mod queue;
mod rows;
mod trigger;
mod worker;
mod workflow;

pub use catalog::{seed_definition, seed_workflow, PgCatalogStore};
pub use queue::PgQueueStore;
pub use trigger::PgTriggerStore;
pub use worker::PgWorkerRegistry;
pub use workflow::PgWorkflowStore;
