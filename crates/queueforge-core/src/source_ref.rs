//! Workflow source-ref codec: a job created on behalf of a workflow step
//! carries a `source_ref` string pointing back at `(run_id, step_key)` so
//! the orchestrator can recognize "this job's completion belongs to my step
//! run" without a dedicated foreign key on `jobs`. The pointer is one-way;
//! `Job` itself stays ignorant of workflows.

use uuid::Uuid;

use crate::error::QueueError;

const PREFIX: &str = "workflow";

pub fn make_workflow_source_ref(run_id: Uuid, step_key: &str) -> String {
    format!("{PREFIX}:{run_id}:{step_key}")
}

/// Parses a source-ref produced by [`make_workflow_source_ref`].
///
/// Step keys are restricted to `[A-Za-z0-9_-]+` at definition time (see
/// `model::WorkflowStepSpec`), so splitting on `:` is unambiguous even
/// though step keys could theoretically contain arbitrary text.
pub fn parse_workflow_source_ref(source_ref: &str) -> Result<(Uuid, String), QueueError> {
    let mut parts = source_ref.splitn(3, ':');
    let prefix = parts.next().unwrap_or_default();
    let run_id = parts.next();
    let step_key = parts.next();

    match (prefix, run_id, step_key) {
        (PREFIX, Some(run_id), Some(step_key)) if !step_key.is_empty() => {
            let run_id = Uuid::parse_str(run_id).map_err(|_| {
                QueueError::Validation(format!("malformed workflow source_ref: {source_ref}"))
            })?;
            Ok((run_id, step_key.to_string()))
        }
        _ => Err(QueueError::Validation(format!(
            "malformed workflow source_ref: {source_ref}"
        ))),
    }
}

/// Whether a source_ref was produced for a workflow step, as opposed to a
/// job enqueued directly by a trigger or the control API.
pub fn is_workflow_source_ref(source_ref: &str) -> bool {
    source_ref.starts_with(PREFIX) && source_ref.as_bytes().get(PREFIX.len()) == Some(&b':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let run_id = Uuid::new_v4();
        let source_ref = make_workflow_source_ref(run_id, "extract_frames");
        let (parsed_run_id, parsed_step_key) = parse_workflow_source_ref(&source_ref).unwrap();
        assert_eq!(parsed_run_id, run_id);
        assert_eq!(parsed_step_key, "extract_frames");
    }

    #[test]
    fn rejects_malformed_refs() {
        assert!(parse_workflow_source_ref("not-a-source-ref").is_err());
        assert!(parse_workflow_source_ref("workflow:not-a-uuid:step").is_err());
        assert!(parse_workflow_source_ref("workflow:").is_err());
    }

    #[test]
    fn detects_workflow_refs_without_parsing() {
        let run_id = Uuid::new_v4();
        let source_ref = make_workflow_source_ref(run_id, "step");
        assert!(is_workflow_source_ref(&source_ref));
        assert!(!is_workflow_source_ref("trigger:cron:nightly-sweep"));
    }
}
