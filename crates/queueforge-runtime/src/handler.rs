//! Pluggable job execution.
//!
//! [`JobDefinition`] carries no argv/command column; this core is agnostic to
//! how a definition's work actually gets done. A [`HandlerRegistry`] maps a
//! definition key to a [`JobHandler`] at process wiring time — one concrete
//! handler (`CommandHandler`, argv + templated env) is provided for the
//! common "shell out to a binary" case, and embedders register their own
//! [`JobHandler`] impls for in-process tasks.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use queueforge_core::model::{Job, TAIL_MAX_BYTES};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// What a handler produced, before the worker loop turns it into a
/// `complete_attempt` call.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// Executes one job attempt. Implementors own whatever it takes to run the
/// work — spawning a subprocess, calling an in-process function, dispatching
/// to another service — and report back an exit code plus captured tails.
///
/// The worker loop applies `timeout_seconds` around this call; a handler
/// does not need its own timeout logic.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> anyhow::Result<HandlerOutput>;
}

/// Maps a [`queueforge_core::model::JobDefinition::key`] to the handler that
/// knows how to run it. A worker with no handler registered for a claimed
/// job's definition reports that attempt `failed` rather than panicking —
/// a missing handler is an operator misconfiguration, not a worker bug.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition_key: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(definition_key.into(), handler);
        self
    }

    pub fn resolve(&self, definition_key: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(definition_key).cloned()
    }
}

/// Runs `argv[0] argv[1..]` as a subprocess, passing the job's normalized
/// payload as `QUEUEFORGE_JOB_PAYLOAD` (JSON) and capturing the last
/// [`TAIL_MAX_BYTES`] of stdout/stderr, matching the ring-buffer bound used
/// for `JobAttempt::stdout_tail`/`stderr_tail`.
pub struct CommandHandler {
    pub argv: Vec<String>,
}

impl CommandHandler {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn execute(&self, job: &Job) -> anyhow::Result<HandlerOutput> {
        let (program, args) = self.argv.split_first().ok_or_else(|| anyhow::anyhow!("empty argv"))?;
        let payload = serde_json::to_string(&job.payload)?;

        let mut child = Command::new(program)
            .args(args)
            .env("QUEUEFORGE_JOB_ID", job.id.to_string())
            .env("QUEUEFORGE_JOB_PAYLOAD", payload)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let stdout_task = tokio::spawn(async move { read_tail(&mut stdout).await });
        let stderr_task = tokio::spawn(async move { read_tail(&mut stderr).await });

        let status = child.wait().await?;
        let stdout_tail = stdout_task.await.unwrap_or_default();
        let stderr_tail = stderr_task.await.unwrap_or_default();

        Ok(HandlerOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout_tail,
            stderr_tail,
        })
    }
}

/// Reads `reader` to completion, keeping only the last [`TAIL_MAX_BYTES`]
/// bytes in memory — a long-running process must not let its stdout grow
/// the worker's own memory unbounded.
async fn read_tail(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > TAIL_MAX_BYTES * 2 {
                    let drop = buf.len() - TAIL_MAX_BYTES;
                    buf.drain(..drop);
                }
            }
        }
    }
    if buf.len() > TAIL_MAX_BYTES {
        let drop = buf.len() - TAIL_MAX_BYTES;
        buf.drain(..drop);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use queueforge_core::model::{JobSource, JobStatus};
    use serde_json::Map;
    use uuid::Uuid;

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            definition_id: Uuid::new_v4(),
            source: JobSource::Manual,
            source_ref: None,
            status: JobStatus::Running,
            priority: 100,
            payload: Map::new(),
            dedupe_key: None,
            correlation_id: None,
            scheduled_for: now,
            queued_at: now,
            started_at: Some(now),
            finished_at: None,
            attempt_count: 1,
            max_attempts: 3,
            lease_expires_at: Some(now),
            claimed_by_worker: Some("worker-1".to_string()),
            last_error: None,
            created_by: None,
        }
    }

    #[test]
    fn registry_resolves_by_definition_key() {
        struct Noop;
        #[async_trait]
        impl JobHandler for Noop {
            async fn execute(&self, _job: &Job) -> anyhow::Result<HandlerOutput> {
                Ok(HandlerOutput { exit_code: 0, stdout_tail: String::new(), stderr_tail: String::new() })
            }
        }
        let mut registry = HandlerRegistry::new();
        registry.register("thumbnail_extract", Arc::new(Noop));
        assert!(registry.resolve("thumbnail_extract").is_some());
        assert!(registry.resolve("unregistered_key").is_none());
    }

    #[tokio::test]
    async fn command_handler_captures_exit_code_and_stdout() {
        let handler = CommandHandler::new(vec!["/bin/sh".to_string(), "-c".to_string(), "echo hello; exit 3".to_string()]);
        let output = handler.execute(&sample_job()).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout_tail.trim(), "hello");
    }
}
