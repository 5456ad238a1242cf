//! Flat env-var configuration for the worker/janitor/scheduler binaries:
//! a flat settings struct loaded from `std::env` with typed defaults rather
//! than a config file or a builder — appropriate here since there is
//! exactly one process role per binary and no nested sections to namespace.

use std::time::Duration;

use anyhow::{Context, Result};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Settings shared by every binary in this crate.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_url: String,
    pub worker_id: String,
    pub hostname: String,
    pub version: String,
    /// Accepted definition keys, or `["*"]` for every definition.
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub janitor_interval: Duration,
    pub stale_threshold: Duration,
    pub shutdown_grace: Duration,
}

impl RuntimeConfig {
    /// Loads configuration from the process environment.
    ///
    /// `QUEUEFORGE_WORKER_ID` defaults to `{hostname}-{pid}` so two workers
    /// on the same host never collide without operator intervention.
    pub fn from_env() -> Result<Self> {
        let hostname = env_or("QUEUEFORGE_HOSTNAME", &hostname_fallback());
        let worker_id = env_or("QUEUEFORGE_WORKER_ID", &format!("{hostname}-{}", std::process::id()));
        let queues = env_or("QUEUEFORGE_QUEUES", "*")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_id,
            hostname,
            version: env_or("QUEUEFORGE_VERSION", env!("CARGO_PKG_VERSION")),
            queues,
            concurrency: env_parse("QUEUEFORGE_CONCURRENCY", 4usize)?,
            poll_interval: Duration::from_millis(env_parse("QUEUEFORGE_POLL_INTERVAL_MS", 1_000u64)?),
            janitor_interval: Duration::from_secs(env_parse("QUEUEFORGE_JANITOR_INTERVAL_SECS", 30u64)?),
            stale_threshold: Duration::from_secs(env_parse("QUEUEFORGE_STALE_THRESHOLD_SECS", 120u64)?),
            shutdown_grace: Duration::from_secs(env_parse("QUEUEFORGE_SHUTDOWN_GRACE_SECS", 30u64)?),
        })
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        // A key that is never set in this process's environment.
        let value: u64 = env_parse("QUEUEFORGE_TEST_UNSET_KEY_XYZ", 42).unwrap();
        assert_eq!(value, 42);
    }
}
