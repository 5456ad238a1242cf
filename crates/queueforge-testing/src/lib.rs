//! In-memory store fixtures for exercising the orchestration core without a
//! database.
//!
//! A single [`InMemoryStore`] implements every trait in
//! `queueforge_core::store` by locking a plain `Mutex<State>` — no pooling,
//! no transactions, intentionally the simplest thing that honors the same
//! observable contract as `queueforge-postgres`.

mod clock;
mod fixtures;
mod store;

pub use clock::FakeClock;
pub use fixtures::{job_definition, trigger, workflow_definition};
pub use store::InMemoryStore;
