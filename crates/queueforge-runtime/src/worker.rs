//! Worker poll loop: claims a batch, spawns one task per claimed job onto a
//! tracked `JoinSet`, heartbeats each in-flight attempt concurrently with
//! its timeout, and drains the set for a grace period on shutdown before
//! aborting whatever remains.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use queueforge_core::model::{AttemptOutcome, Job, Worker};
use queueforge_core::store::{CatalogStore, ClaimedJob, CompleteAttempt, QueueStore, WorkerRegistry};
use queueforge_orchestrator::Orchestrator;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::handler::HandlerRegistry;

/// Everything a worker loop iteration needs; cheap to clone (all `Arc`s).
#[derive(Clone)]
pub struct WorkerRuntime {
    queue: Arc<dyn QueueStore>,
    catalog: Arc<dyn CatalogStore>,
    workers: Arc<dyn WorkerRegistry>,
    orchestrator: Arc<Orchestrator>,
    handlers: Arc<HandlerRegistry>,
    config: Arc<RuntimeConfig>,
}

const MIN_LEASE_SECONDS: i64 = 30;

/// `min(timeout_seconds, 15 min) + 30s`.
fn lease_duration_for(timeout_seconds: i32) -> ChronoDuration {
    let capped = timeout_seconds.min(15 * 60).max(0) as i64;
    ChronoDuration::seconds(capped) + ChronoDuration::seconds(MIN_LEASE_SECONDS)
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        catalog: Arc<dyn CatalogStore>,
        workers: Arc<dyn WorkerRegistry>,
        orchestrator: Arc<Orchestrator>,
        handlers: Arc<HandlerRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self { queue, catalog, workers, orchestrator, handlers, config: Arc::new(config) }
    }

    /// Runs until `shutdown` fires, then stops claiming new work, waits up
    /// to `shutdown_grace` for in-flight attempts, and aborts the rest as
    /// `canceled`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.workers
            .register(Worker {
                worker_id: self.config.worker_id.clone(),
                hostname: self.config.hostname.clone(),
                version: self.config.version.clone(),
                queues: self.config.queues.clone(),
                last_seen_at: Utc::now(),
                running_count: 0,
                metadata: Default::default(),
            })
            .await?;
        info!(worker_id = %self.config.worker_id, "worker registered");

        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let slots = self.config.concurrency.saturating_sub(in_flight.len());
            let claimed = if slots > 0 {
                self.queue
                    .claim_ready(
                        &self.config.worker_id,
                        &self.config.queues,
                        slots as i64,
                        ChronoDuration::seconds(15 * 60 + MIN_LEASE_SECONDS),
                        Utc::now(),
                    )
                    .await?
            } else {
                Vec::new()
            };

            if claimed.is_empty() {
                self.workers
                    .heartbeat_worker(&self.config.worker_id, Utc::now(), in_flight.len() as i32)
                    .await
                    .ok();
                let jitter_ms = fastrand::u64(0..250);
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval + StdDuration::from_millis(jitter_ms)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for claimed_job in claimed {
                self.orchestrator.on_child_claimed(&claimed_job.job, Utc::now()).await.ok();
                let this = self.clone();
                in_flight.spawn(async move { this.run_claimed_job(claimed_job).await });
            }

            while let Some(result) = in_flight.try_join_next() {
                if let Err(err) = result {
                    warn!(%err, "worker task panicked");
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "shutting down, draining in-flight attempts");
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(worker_id = %self.config.worker_id, "shutdown grace expired, aborting remaining attempts");
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
        self.workers.deregister(&self.config.worker_id).await.ok();
        Ok(())
    }

    /// Runs one claimed attempt end to end: resolve handler, execute under
    /// `timeout_seconds`, heartbeat concurrently, and report the outcome.
    /// Exposed directly (not just through [`WorkerRuntime::run`]) so it can
    /// be unit-tested without a live poll loop.
    pub async fn run_claimed_job(&self, claimed: ClaimedJob) {
        let ClaimedJob { job, attempt } = claimed;
        let Ok(definition) = self.catalog.get_definition_by_id(job.definition_id).await else {
            self.fail_unresolvable(&job, attempt.id, "job definition not found").await;
            return;
        };

        let Some(handler) = self.handlers.resolve(&definition.key) else {
            self.fail_unresolvable(&job, attempt.id, "no handler registered for definition").await;
            return;
        };

        let lease_duration = lease_duration_for(definition.timeout_seconds);
        let (lost_tx, mut lost_rx) = watch::channel(false);
        let heartbeat_queue = self.queue.clone();
        let worker_id = self.config.worker_id.clone();
        let job_id = job.id;
        let heartbeat_interval = to_std((lease_duration / 3).max(ChronoDuration::seconds(1)));
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat_interval).await;
                if heartbeat_queue.heartbeat(job_id, &worker_id, lease_duration, Utc::now()).await.is_err() {
                    let _ = lost_tx.send(true);
                    break;
                }
            }
        });

        let timeout = StdDuration::from_secs(definition.timeout_seconds.max(1) as u64);
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, handler.execute(&job)) => {
                self.outcome_for(job.id, attempt.id, result, definition.timeout_seconds)
            }
            _ = lost_rx.changed() => CompleteAttempt {
                job_id: job.id,
                attempt_id: attempt.id,
                worker_id: self.config.worker_id.clone(),
                outcome: AttemptOutcome::Canceled,
                exit_code: None,
                stdout_tail: None,
                stderr_tail: None,
                error_text: Some("lease lost".to_string()),
            },
        };

        heartbeat_task.abort();
        self.complete_and_notify(outcome).await;
    }

    fn outcome_for(
        &self,
        job_id: uuid::Uuid,
        attempt_id: uuid::Uuid,
        result: Result<anyhow::Result<crate::handler::HandlerOutput>, tokio::time::error::Elapsed>,
        timeout_seconds: i32,
    ) -> CompleteAttempt {
        let worker_id = self.config.worker_id.clone();
        match result {
            Ok(Ok(output)) if output.exit_code == 0 => CompleteAttempt {
                job_id,
                attempt_id,
                worker_id,
                outcome: AttemptOutcome::Succeeded,
                exit_code: Some(output.exit_code),
                stdout_tail: Some(output.stdout_tail),
                stderr_tail: Some(output.stderr_tail),
                error_text: None,
            },
            Ok(Ok(output)) => CompleteAttempt {
                job_id,
                attempt_id,
                worker_id,
                outcome: AttemptOutcome::Failed,
                exit_code: Some(output.exit_code),
                stdout_tail: Some(output.stdout_tail),
                stderr_tail: Some(output.stderr_tail),
                error_text: Some(format!("exited with status {}", output.exit_code)),
            },
            Ok(Err(err)) => CompleteAttempt {
                job_id,
                attempt_id,
                worker_id,
                outcome: AttemptOutcome::Failed,
                exit_code: None,
                stdout_tail: None,
                stderr_tail: None,
                error_text: Some(err.to_string()),
            },
            Err(_elapsed) => CompleteAttempt {
                job_id,
                attempt_id,
                worker_id,
                outcome: AttemptOutcome::Timeout,
                exit_code: None,
                stdout_tail: None,
                stderr_tail: None,
                error_text: Some(format!("exceeded timeout_seconds={timeout_seconds}")),
            },
        }
    }

    async fn complete_and_notify(&self, completion: CompleteAttempt) {
        let now = Utc::now();
        match self.queue.complete_attempt(completion, now).await {
            Ok(updated_job) => {
                self.orchestrator.on_job_state_change(&updated_job, now).await.ok();
            }
            Err(err) => warn!(%err, "complete_attempt failed"),
        }
    }

    async fn fail_unresolvable(&self, job: &Job, attempt_id: uuid::Uuid, reason: &str) {
        warn!(job_id = %job.id, %attempt_id, reason, "cannot execute claimed job");
        self.complete_and_notify(CompleteAttempt {
            job_id: job.id,
            attempt_id,
            worker_id: self.config.worker_id.clone(),
            outcome: AttemptOutcome::Failed,
            exit_code: None,
            stdout_tail: None,
            stderr_tail: None,
            error_text: Some(reason.to_string()),
        })
        .await;
    }
}

fn to_std(d: ChronoDuration) -> StdDuration {
    d.to_std().unwrap_or(StdDuration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use queueforge_core::model::JobStatus;
    use queueforge_core::store::EnqueueJob;
    use queueforge_testing::{job_definition, InMemoryStore};
    use uuid::Uuid;

    struct EchoHandler;
    #[async_trait]
    impl crate::handler::JobHandler for EchoHandler {
        async fn execute(&self, _job: &Job) -> anyhow::Result<crate::handler::HandlerOutput> {
            Ok(crate::handler::HandlerOutput { exit_code: 0, stdout_tail: "ok".to_string(), stderr_tail: String::new() })
        }
    }

    struct BoomHandler;
    #[async_trait]
    impl crate::handler::JobHandler for BoomHandler {
        async fn execute(&self, _job: &Job) -> anyhow::Result<crate::handler::HandlerOutput> {
            anyhow::bail!("synthetic failure")
        }
    }

    fn wire(store: &Arc<InMemoryStore>, handlers: HandlerRegistry) -> WorkerRuntime {
        let queue: Arc<dyn QueueStore> = store.clone();
        let catalog: Arc<dyn CatalogStore> = store.clone();
        let workers: Arc<dyn WorkerRegistry> = store.clone();
        let workflows: Arc<dyn queueforge_core::store::WorkflowStore> = store.clone();
        let orchestrator = Arc::new(Orchestrator::new(queue.clone(), workflows, catalog.clone()));
        let config = RuntimeConfig {
            database_url: String::new(),
            worker_id: "worker-1".to_string(),
            hostname: "test-host".to_string(),
            version: "0.0.0-test".to_string(),
            queues: vec!["*".to_string()],
            concurrency: 4,
            poll_interval: StdDuration::from_millis(10),
            janitor_interval: StdDuration::from_secs(30),
            stale_threshold: StdDuration::from_secs(120),
            shutdown_grace: StdDuration::from_secs(1),
        };
        WorkerRuntime::new(queue, catalog, workers, orchestrator, Arc::new(handlers), config)
    }

    #[tokio::test]
    async fn run_claimed_job_marks_a_successful_attempt_succeeded() {
        let store = Arc::new(InMemoryStore::new());
        let definition_id = store.seed_definition(job_definition("echo_job"));
        let mut handlers = HandlerRegistry::new();
        handlers.register("echo_job", Arc::new(EchoHandler));
        let runtime = wire(&store, handlers);

        let queue: Arc<dyn QueueStore> = store.clone();
        let now = Utc::now();
        queue
            .enqueue(EnqueueJob {
                tenant_id: Uuid::new_v4(),
                definition_id,
                source: queueforge_core::model::JobSource::Manual,
                source_ref: None,
                priority: 100,
                payload: Default::default(),
                dedupe_key: None,
                correlation_id: None,
                scheduled_for: now,
                max_attempts: 3,
                created_by: None,
            })
            .await
            .unwrap();

        let claimed = queue.claim_ready("worker-1", &["*".to_string()], 1, ChronoDuration::seconds(60), now).await.unwrap();
        let job_id = claimed[0].job.id;
        runtime.run_claimed_job(claimed.into_iter().next().unwrap()).await;

        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn run_claimed_job_retries_a_failing_attempt_until_dead_letter() {
        let store = Arc::new(InMemoryStore::new());
        let mut definition = job_definition("boom_job");
        definition.max_attempts = 1;
        let definition_id = store.seed_definition(definition);
        let mut handlers = HandlerRegistry::new();
        handlers.register("boom_job", Arc::new(BoomHandler));
        let runtime = wire(&store, handlers);

        let queue: Arc<dyn QueueStore> = store.clone();
        let now = Utc::now();
        queue
            .enqueue(EnqueueJob {
                tenant_id: Uuid::new_v4(),
                definition_id,
                source: queueforge_core::model::JobSource::Manual,
                source_ref: None,
                priority: 100,
                payload: Default::default(),
                dedupe_key: None,
                correlation_id: None,
                scheduled_for: now,
                max_attempts: 1,
                created_by: None,
            })
            .await
            .unwrap();

        let claimed = queue.claim_ready("worker-1", &["*".to_string()], 1, ChronoDuration::seconds(60), now).await.unwrap();
        let job_id = claimed[0].job.id;
        runtime.run_claimed_job(claimed.into_iter().next().unwrap()).await;

        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert!(job.last_error.as_deref().unwrap_or_default().contains("synthetic failure"));
    }

    #[tokio::test]
    async fn missing_handler_fails_the_attempt_without_panicking() {
        let store = Arc::new(InMemoryStore::new());
        let mut definition = job_definition("unhandled_job");
        definition.max_attempts = 1;
        let definition_id = store.seed_definition(definition);
        let runtime = wire(&store, HandlerRegistry::new());

        let queue: Arc<dyn QueueStore> = store.clone();
        let now = Utc::now();
        queue
            .enqueue(EnqueueJob {
                tenant_id: Uuid::new_v4(),
                definition_id,
                source: queueforge_core::model::JobSource::Manual,
                source_ref: None,
                priority: 100,
                payload: Default::default(),
                dedupe_key: None,
                correlation_id: None,
                scheduled_for: now,
                max_attempts: 1,
                created_by: None,
            })
            .await
            .unwrap();

        let claimed = queue.claim_ready("worker-1", &["*".to_string()], 1, ChronoDuration::seconds(60), now).await.unwrap();
        let job_id = claimed[0].job.id;
        runtime.run_claimed_job(claimed.into_iter().next().unwrap()).await;

        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
    }
}
