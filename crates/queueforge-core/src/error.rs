//! Error kinds for the queue and workflow core.
//!
//! Mirrors the split in `examples/other_examples/.../pgqueue.rs`'s
//! `DatabaseError`/`RetryError` — a small `thiserror` enum at the library
//! boundary, with a stable string tag (`category`) surfaced to API callers
//! instead of a Rust type name.

use uuid::Uuid;

use crate::model::Job;

/// Closed set of error kinds a caller of the queue/workflow core may observe.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Bad payload shape/value. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// An active job already exists with the same dedupe key.
    #[error("dedupe conflict: existing job {existing_job_id}")]
    DedupConflict { existing_job_id: Uuid },

    /// Missing job/definition/run/trigger/worker.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's lease on a job was lost (worker changed or job no
    /// longer running). Not an application bug — callers abort quietly.
    #[error("lease lost for job {job_id}")]
    LeaseLost { job_id: Uuid },

    /// Retryable connection/lock-wait issue from the storage layer.
    #[error("transient store error: {0}")]
    TransientStore(#[from] TransientStoreError),

    /// During workflow step enqueue, the step's definition is missing or inactive.
    #[error("definition unavailable: {0}")]
    DefinitionUnavailable(String),

    /// Task failure reported by a worker; the retry ladder applies upstream.
    #[error("execution error: {0}")]
    FatalExecution(String),
}

/// Wraps an underlying storage error so `QueueError` doesn't need a direct
/// `sqlx` dependency (kept out of `queueforge-core` on purpose — the core is
/// storage-agnostic).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransientStoreError {
    pub message: String,
}

impl TransientStoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// A stable tag for API responses, independent of the Rust type name or
/// Display message.
pub trait SafeErrorCategory {
    fn category(&self) -> &'static str;
}

impl SafeErrorCategory for QueueError {
    fn category(&self) -> &'static str {
        match self {
            QueueError::Validation(_) => "validation_error",
            QueueError::DedupConflict { .. } => "dedup_conflict",
            QueueError::NotFound(_) => "not_found",
            QueueError::LeaseLost { .. } => "lease_lost",
            QueueError::TransientStore(_) => "transient_store_error",
            QueueError::DefinitionUnavailable(_) => "definition_unavailable",
            QueueError::FatalExecution(_) => "fatal_execution_error",
        }
    }
}

impl QueueError {
    /// Whether a bounded-retry caller (§7 `TransientStoreError` policy)
    /// should retry this error at all.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::TransientStore(_))
    }
}

/// Outcome of a batch operation where individual items may fail
/// independently — e.g. fanning a published event out across triggers.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<(String, QueueError)>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self { succeeded: Vec::new(), failed: Vec::new() }
    }
}

/// Result of inserting a job: either the newly created row, or the existing
/// active row that caused a dedupe conflict, surfaced as a non-error result
/// carrying the existing job id rather than an error variant.
#[derive(Debug)]
pub enum InsertOutcome {
    Created(Job),
    Deduplicated(Job),
}

impl InsertOutcome {
    pub fn job(&self) -> &Job {
        match self {
            InsertOutcome::Created(job) | InsertOutcome::Deduplicated(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            InsertOutcome::Created(job) | InsertOutcome::Deduplicated(job) => job,
        }
    }

    pub fn was_deduplicated(&self) -> bool {
        matches!(self, InsertOutcome::Deduplicated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_stable_strings() {
        assert_eq!(QueueError::Validation("x".into()).category(), "validation_error");
        assert_eq!(
            QueueError::LeaseLost { job_id: Uuid::nil() }.category(),
            "lease_lost"
        );
    }

    #[test]
    fn only_transient_store_is_retryable() {
        assert!(QueueError::TransientStore(TransientStoreError::new("timeout")).is_retryable());
        assert!(!QueueError::Validation("x".into()).is_retryable());
    }
}
