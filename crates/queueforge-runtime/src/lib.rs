//! Worker poll loop, lease janitor, and trigger engine for the job and
//! workflow orchestration core.
//!
//! This crate is the process layer: it composes the storage traits from
//! `queueforge-core` (concretely, `queueforge-postgres` in production) with
//! an `Orchestrator` from `queueforge-orchestrator` to run workers,
//! janitors, and trigger schedulers as long-lived binaries. Nothing in
//! `queueforge-core`/`queueforge-orchestrator` depends on this crate.

pub mod config;
pub mod handler;
pub mod janitor;
pub mod trigger;
pub mod worker;

pub use config::RuntimeConfig;
pub use handler::{CommandHandler, HandlerOutput, HandlerRegistry, JobHandler};
pub use worker::WorkerRuntime;
