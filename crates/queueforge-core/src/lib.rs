//! Domain types, storage traits, and the error taxonomy shared by every
//! crate in the queueforge job and workflow orchestration core.
//!
//! This crate is intentionally storage-agnostic: it defines the shapes
//! ([`model`]), the operations a backend must support ([`store`]), the
//! closed error taxonomy callers observe ([`error`]), and the pure helpers
//! those operations lean on — payload normalization, backoff math, the
//! workflow source-ref codec, cron evaluation. `queueforge-postgres` is the
//! production implementation of the traits defined here.

pub mod backoff;
pub mod error;
pub mod model;
pub mod schedule;
pub mod source_ref;
pub mod store;
pub mod validate;

pub use error::{BatchOutcome, InsertOutcome, QueueError, SafeErrorCategory, TransientStoreError};
pub use store::{CatalogStore, ErrorUpdate, QueueStore, TriggerStore, WorkerRegistry, WorkflowStore};
