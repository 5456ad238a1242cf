//! Workflow DAG orchestration: validating step graphs, driving a run's
//! step-by-step job enqueue, propagating child job outcomes back onto step
//! state, and sweeping running workflows for missed callbacks.
//!
//! Composes [`queueforge_core::store::QueueStore`],
//! [`queueforge_core::store::WorkflowStore`], and
//! [`queueforge_core::store::CatalogStore`] as trait objects, so an
//! [`Orchestrator`] runs the same against `queueforge-postgres` in production
//! or `queueforge-testing::InMemoryStore` in unit tests.

mod dag;
mod orchestrator;
mod reconciler;

pub use dag::validate_steps;
pub use orchestrator::Orchestrator;
pub use queueforge_core::store::WorkflowStats;
pub use reconciler::reconcile_running_workflows;
