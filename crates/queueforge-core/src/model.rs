//! Domain types for the job and workflow orchestration core.
//!
//! Column shapes mirror the relational schema in
//! `queueforge-postgres/migrations` (itself transliterated from
//! `alembic/versions/202602160915_add_job_queue_tables.py` and
//! `202602161700_add_workflow_queue_tables.py`). Enumerations are modeled as
//! closed Rust enums backed by `CHECK (col IN (...))` text columns rather
//! than native Postgres enum types, matching the source schema.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Error returned when a string does not name a known enum variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! closed_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $variant:ident => $text:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $variant ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(UnknownVariant { kind: stringify!($name), value: other.to_string() }),
                }
            }
        }
    };
}

closed_enum! {
    /// `jobs.status`.
    JobStatus {
        Queued => "queued",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
        Canceled => "canceled",
        DeadLetter => "dead_letter",
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::DeadLetter
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

closed_enum! {
    /// `jobs.source`.
    JobSource {
        Manual => "manual",
        Event => "event",
        Schedule => "schedule",
        System => "system",
    }
}

closed_enum! {
    /// `job_attempts.status`.
    AttemptStatus {
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
        Timeout => "timeout",
        Canceled => "canceled",
    }
}

/// Outcome reported by a worker when it calls `complete_attempt` (§4.6).
///
/// A proper subset of [`AttemptStatus`]: an attempt can never be *reported*
/// complete while still `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    Timeout,
    Canceled,
}

impl AttemptOutcome {
    pub fn as_attempt_status(&self) -> AttemptStatus {
        match self {
            AttemptOutcome::Succeeded => AttemptStatus::Succeeded,
            AttemptOutcome::Failed => AttemptStatus::Failed,
            AttemptOutcome::Timeout => AttemptStatus::Timeout,
            AttemptOutcome::Canceled => AttemptStatus::Canceled,
        }
    }

    /// Failed/timeout attempts follow the retry ladder; succeeded/canceled do not.
    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, AttemptOutcome::Failed | AttemptOutcome::Timeout)
    }
}

closed_enum! {
    /// `job_triggers.trigger_type`.
    TriggerType {
        Event => "event",
        Schedule => "schedule",
    }
}

closed_enum! {
    /// `workflow_definitions.failure_policy` / `workflow_runs.failure_policy`.
    FailurePolicy {
        FailFast => "fail_fast",
        Continue => "continue",
    }
}

closed_enum! {
    /// `workflow_runs.status`.
    WorkflowRunStatus {
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
        Canceled => "canceled",
    }
}

impl WorkflowRunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowRunStatus::Running)
    }
}

closed_enum! {
    /// `workflow_step_runs.status`.
    WorkflowStepStatus {
        Pending => "pending",
        Queued => "queued",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
        Canceled => "canceled",
        Skipped => "skipped",
    }
}

impl WorkflowStepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStepStatus::Succeeded
                | WorkflowStepStatus::Failed
                | WorkflowStepStatus::Canceled
                | WorkflowStepStatus::Skipped
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            WorkflowStepStatus::Pending | WorkflowStepStatus::Queued | WorkflowStepStatus::Running
        )
    }

    /// A dependency in this state blocks its dependents from ever succeeding.
    pub fn is_terminal_non_success(&self) -> bool {
        matches!(
            self,
            WorkflowStepStatus::Failed | WorkflowStepStatus::Canceled | WorkflowStepStatus::Skipped
        )
    }
}

/// Immutable-by-key contract for a class of work (§3 JobDefinition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: Uuid,
    pub key: String,
    pub description: String,
    /// Queue-eligible parameter set, see [`crate::validate::PayloadSchema`].
    pub arg_schema: Map<String, Value>,
    pub timeout_seconds: i32,
    pub max_attempts: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Source of automatic work (§3 JobTrigger).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTrigger {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub label: String,
    pub is_enabled: bool,
    pub trigger_type: TriggerType,
    pub event_name: Option<String>,
    pub cron_expr: Option<String>,
    pub timezone: Option<String>,
    pub definition_id: Uuid,
    pub payload_template: Map<String, Value>,
    pub dedupe_window_seconds: i32,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobTrigger {
    /// Enforces the §3 invariant: exactly one of `event_name` or
    /// (`cron_expr` ∧ `timezone`) is set, consistent with `trigger_type`.
    pub fn is_well_formed(&self) -> bool {
        match self.trigger_type {
            TriggerType::Event => self.event_name.is_some() && self.cron_expr.is_none(),
            TriggerType::Schedule => {
                self.cron_expr.is_some() && self.timezone.is_some() && self.event_name.is_none()
            }
        }
    }
}

/// One unit of durable work (§3 Job).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub definition_id: Uuid,
    pub source: JobSource,
    pub source_ref: Option<String>,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: Map<String, Value>,
    pub dedupe_key: Option<String>,
    pub correlation_id: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub claimed_by_worker: Option<String>,
    pub last_error: Option<String>,
    pub created_by: Option<Uuid>,
}

impl Job {
    /// Checks the §3 per-status invariants hold for this row.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        match self.status {
            JobStatus::Queued => {
                if self.lease_expires_at.is_some() {
                    return Err("queued job must not have lease_expires_at");
                }
                if self.claimed_by_worker.is_some() {
                    return Err("queued job must not have claimed_by_worker");
                }
                if self.started_at.is_some() {
                    return Err("queued job must not have started_at");
                }
            }
            JobStatus::Running => {
                if self.lease_expires_at.is_none() {
                    return Err("running job must have lease_expires_at");
                }
                if self.claimed_by_worker.is_none() {
                    return Err("running job must have claimed_by_worker");
                }
                if self.started_at.is_none() {
                    return Err("running job must have started_at");
                }
            }
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::DeadLetter => {
                if self.finished_at.is_none() {
                    return Err("terminal job must have finished_at");
                }
                if self.lease_expires_at.is_some() || self.claimed_by_worker.is_some() {
                    return Err("terminal job must have lease cleared");
                }
            }
        }
        Ok(())
    }
}

/// Audit trail of one execution pass (§3 JobAttempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub id: Uuid,
    pub job_id: Uuid,
    pub attempt_no: i32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub status: AttemptStatus,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
    pub error_text: Option<String>,
}

/// Bound applied to attempt tails, per §3 ("bounded length, e.g. 16 KiB").
pub const TAIL_MAX_BYTES: usize = 16 * 1024;

/// Bound applied to `last_error` on job rows, per §7.
pub const LAST_ERROR_MAX_BYTES: usize = 2 * 1024;

/// Truncates a string to at most `max_bytes` bytes on a char boundary.
pub fn truncate_to_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Ephemeral process registration (§3 Worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub hostname: String,
    pub version: String,
    pub queues: Vec<String>,
    pub last_seen_at: DateTime<Utc>,
    pub running_count: i32,
    pub metadata: Map<String, Value>,
}

impl Worker {
    pub fn is_stale(&self, now: DateTime<Utc>, stale_threshold: chrono::Duration) -> bool {
        now - self.last_seen_at > stale_threshold
    }

    /// Whether this worker accepts the given definition key, honoring `*` glob entries.
    pub fn accepts(&self, definition_key: &str) -> bool {
        self.queues.iter().any(|q| q == "*" || q == definition_key)
    }
}

/// One step in a [`WorkflowDefinition`]'s DAG template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepSpec {
    pub step_key: String,
    pub definition_key: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// DAG template (§3 WorkflowDefinition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub key: String,
    pub description: String,
    pub steps: Vec<WorkflowStepSpec>,
    pub max_parallel_steps: i32,
    pub failure_policy: FailurePolicy,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution of a [`WorkflowDefinition`] (§3 WorkflowRun).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_definition_id: Uuid,
    pub status: WorkflowRunStatus,
    pub payload: Map<String, Value>,
    pub priority: i32,
    pub max_parallel_steps: i32,
    pub failure_policy: FailurePolicy,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub last_error: Option<String>,
}

/// Per-step progress (§3 WorkflowStepRun).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepRun {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub step_key: String,
    pub definition_id: Uuid,
    pub status: WorkflowStepStatus,
    pub payload: Map<String, Value>,
    pub depends_on: Vec<String>,
    pub child_job_id: Option<Uuid>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::DeadLetter,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(JobStatus::from_str("bogus").is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "a".repeat(10) + "€€€";
        let truncated = truncate_to_bytes(&s, 11);
        assert!(truncated.len() <= 11);
        assert!(s.starts_with(&truncated));
    }
}
