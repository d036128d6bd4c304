//! Workflow DAG execution: declarative stage graphs, per-stage timeout and
//! retry, circuit breaking, and persisted execution records.

pub mod breaker;
pub mod dag;
pub mod executor;

pub use breaker::CircuitBreaker;
pub use dag::{WorkflowDag, WorkflowStage};
pub use executor::WorkflowExecutor;
