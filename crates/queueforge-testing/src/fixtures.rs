//! Builders for the definitions/triggers a test needs to seed before
//! exercising the queue or orchestrator.

use chrono::Utc;
use queueforge_core::model::{FailurePolicy, JobDefinition, JobTrigger, TriggerType, WorkflowDefinition, WorkflowStepSpec};
use serde_json::{Map, Value};
use uuid::Uuid;

pub fn job_definition(key: &str) -> JobDefinition {
    let now = Utc::now();
    JobDefinition {
        id: Uuid::new_v4(),
        key: key.to_string(),
        description: String::new(),
        arg_schema: Map::new(),
        timeout_seconds: 3600,
        max_attempts: 3,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn workflow_definition(key: &str, steps: Vec<WorkflowStepSpec>) -> WorkflowDefinition {
    let now = Utc::now();
    WorkflowDefinition {
        id: Uuid::new_v4(),
        key: key.to_string(),
        description: String::new(),
        steps,
        max_parallel_steps: 2,
        failure_policy: FailurePolicy::FailFast,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn trigger(definition_id: Uuid, event_name: &str) -> JobTrigger {
    let now = Utc::now();
    JobTrigger {
        id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        label: event_name.to_string(),
        is_enabled: true,
        trigger_type: TriggerType::Event,
        event_name: Some(event_name.to_string()),
        cron_expr: None,
        timezone: None,
        definition_id,
        payload_template: Map::<String, Value>::new(),
        dedupe_window_seconds: 300,
        created_by: None,
        created_at: now,
        updated_at: now,
    }
}
