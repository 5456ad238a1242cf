//! Trigger engine: event fan-out and cron-driven schedule firing.
//!
//! Event triggers are invoked synchronously by [`publish_event`] from
//! whatever process receives the event; schedule triggers are driven by
//! [`run_schedule_tick`], a poll loop built on
//! [`queueforge_core::schedule::CronSchedule`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use queueforge_core::error::QueueError;
use queueforge_core::model::{Job, JobSource, JobTrigger};
use queueforge_core::schedule::CronSchedule;
use queueforge_core::store::{EnqueueJob, QueueStore, TriggerStore};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_PRIORITY: i32 = 100;

/// Merges `event_payload` over `trigger.payload_template` (payload wins on
/// key conflict) and hashes the result for the dedup key.
fn merged_payload(trigger: &JobTrigger, event_payload: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = trigger.payload_template.clone();
    for (key, value) in event_payload {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn hash_payload(payload: &Map<String, Value>) -> u64 {
    let mut hasher = DefaultHasher::new();
    // `Value` doesn't implement `Hash`; its canonical JSON string does,
    // and `serde_json::Map` preserves insertion order so this is stable
    // for a fixed `payload` even though it is not stable across key
    // reordering of logically-equal objects.
    serde_json::to_string(payload).unwrap_or_default().hash(&mut hasher);
    hasher.finish()
}

/// Fans `event_name`/`event_payload` out to every enabled event trigger
/// registered for `(tenant_id, event_name)`. Each trigger enqueues
/// independently — one trigger's `DedupConflict` does not block the others.
pub async fn publish_event(
    triggers: &Arc<dyn TriggerStore>,
    queue: &Arc<dyn QueueStore>,
    tenant_id: Uuid,
    event_name: &str,
    event_payload: Map<String, Value>,
    event_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Job>, QueueError> {
    let matching = triggers.list_event_triggers(tenant_id, event_name).await?;
    let mut fired = Vec::with_capacity(matching.len());

    for trigger in matching {
        let payload = merged_payload(&trigger, &event_payload);
        let dedupe_key = format!("trigger:{}:{:x}", trigger.id, hash_payload(&payload));

        let outcome = queue
            .enqueue(EnqueueJob {
                tenant_id,
                definition_id: trigger.definition_id,
                source: JobSource::Event,
                source_ref: Some(event_id.to_string()),
                priority: DEFAULT_PRIORITY,
                payload,
                dedupe_key: Some(dedupe_key),
                correlation_id: Some(format!("trigger:{}", trigger.id)),
                scheduled_for: now,
                max_attempts: 3,
                created_by: None,
            })
            .await?;

        if outcome.was_deduplicated() {
            info!(trigger_id = %trigger.id, %event_name, "event trigger deduplicated against an active job");
        }
        fired.push(outcome.into_job());
    }

    Ok(fired)
}

/// One schedule-engine tick: for each enabled schedule trigger whose next
/// cron fire time (computed in its declared timezone) has passed since it
/// last fired, enqueues a job and advances the trigger's cursor.
///
/// Dedups on `(trigger_id, fire_timestamp)` via the queue's dedupe index,
/// so two scheduler replicas racing the same tick produce one job, not two.
pub async fn run_schedule_tick(
    triggers: &Arc<dyn TriggerStore>,
    queue: &Arc<dyn QueueStore>,
    now: DateTime<Utc>,
) -> Result<Vec<Job>, QueueError> {
    let due = triggers.list_schedule_triggers(now).await?;
    let mut fired = Vec::with_capacity(due.len());

    for trigger in due {
        let (Some(cron_expr), Some(timezone)) = (&trigger.cron_expr, &trigger.timezone) else {
            warn!(trigger_id = %trigger.id, "schedule trigger missing cron_expr/timezone, skipping");
            continue;
        };
        let schedule = match CronSchedule::parse(cron_expr, timezone) {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!(trigger_id = %trigger.id, %err, "schedule trigger has an invalid cron expression");
                continue;
            }
        };

        let Some(fire_at) = schedule.next_after(trigger.updated_at) else { continue };
        if fire_at > now {
            continue;
        }

        let dedupe_key = format!("trigger:{}:{}", trigger.id, fire_at.timestamp());
        let outcome = queue
            .enqueue(EnqueueJob {
                tenant_id: trigger.tenant_id,
                definition_id: trigger.definition_id,
                source: JobSource::Schedule,
                source_ref: Some(format!("{}:{}", trigger.id, fire_at.timestamp())),
                priority: DEFAULT_PRIORITY,
                payload: trigger.payload_template.clone(),
                dedupe_key: Some(dedupe_key),
                correlation_id: Some(format!("trigger:{}", trigger.id)),
                scheduled_for: fire_at,
                max_attempts: 3,
                created_by: None,
            })
            .await?;

        triggers.record_fired(trigger.id, fire_at).await?;
        fired.push(outcome.into_job());
    }

    Ok(fired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use queueforge_core::store::CreateTrigger;
    use queueforge_core::model::TriggerType;
    use queueforge_testing::{job_definition, InMemoryStore};
    use serde_json::json;

    fn wire(store: &Arc<InMemoryStore>) -> (Arc<dyn TriggerStore>, Arc<dyn QueueStore>) {
        (store.clone(), store.clone())
    }

    #[tokio::test]
    async fn event_payload_overrides_the_template_on_conflict() {
        let store = Arc::new(InMemoryStore::new());
        let definition_id = store.seed_definition(job_definition("notify"));
        let (triggers, queue) = wire(&store);
        let tenant_id = Uuid::new_v4();

        triggers
            .create_trigger(CreateTrigger {
                tenant_id,
                label: "on upload".to_string(),
                trigger_type: TriggerType::Event,
                event_name: Some("media.uploaded".to_string()),
                cron_expr: None,
                timezone: None,
                definition_id,
                payload_template: [("priority".to_string(), json!("low"))].into_iter().collect(),
                dedupe_window_seconds: 60,
                created_by: None,
            })
            .await
            .unwrap();

        let now = Utc::now();
        let event_payload: Map<String, Value> = [("priority".to_string(), json!("high")), ("asset_id".to_string(), json!("a1"))]
            .into_iter()
            .collect();
        let fired = publish_event(&triggers, &queue, tenant_id, "media.uploaded", event_payload, "evt-1", now).await.unwrap();

        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].payload.get("priority"), Some(&json!("high")));
        assert_eq!(fired[0].payload.get("asset_id"), Some(&json!("a1")));
    }

    #[tokio::test]
    async fn unmatched_event_name_fires_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let (triggers, queue) = wire(&store);
        let fired = publish_event(&triggers, &queue, Uuid::new_v4(), "unrelated.event", Map::new(), "evt-2", Utc::now()).await.unwrap();
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn schedule_tick_fires_once_a_due_cron_trigger_and_advances_the_cursor() {
        let store = Arc::new(InMemoryStore::new());
        let definition_id = store.seed_definition(job_definition("nightly_sweep"));
        let (triggers, queue) = wire(&store);
        let tenant_id = Uuid::new_v4();

        let created = triggers
            .create_trigger(CreateTrigger {
                tenant_id,
                label: "nightly".to_string(),
                trigger_type: TriggerType::Schedule,
                event_name: None,
                cron_expr: Some("0 0 0 * * *".to_string()),
                timezone: Some("UTC".to_string()),
                definition_id,
                payload_template: Map::new(),
                dedupe_window_seconds: 60,
                created_by: None,
            })
            .await
            .unwrap();

        let schedule = CronSchedule::parse("0 0 0 * * *", "UTC").unwrap();
        let first_fire = schedule.next_after(created.updated_at).unwrap();

        let fired = run_schedule_tick(&triggers, &queue, first_fire).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].source, JobSource::Schedule);

        // Same tick instant again: the cursor already advanced past it.
        let fired_again = run_schedule_tick(&triggers, &queue, first_fire).await.unwrap();
        assert!(fired_again.is_empty());
    }
}
