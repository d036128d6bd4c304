//! Quality-gated generation engine for business value cases.
//!
//! The crate is organized around a small set of orchestration components:
//!
//! - `core::limits`: per-attempt safety caps (wall clock, call count,
//!   recursion depth, memory) with cooperative cancellation
//! - `core::retry`: exponential backoff with jitter around every external
//!   call, gated on error retryability
//! - [`quality`]: the six-dimension rubric gate that decides whether an
//!   artifact is good enough
//! - [`refine`]: the bounded generate, evaluate, refine loop
//! - [`stages`]: the deterministic lifecycle state machine
//! - [`workflow`]: declarative stage graphs with timeouts, retries and
//!   circuit breaking
//! - [`state`]: the persistence contract plus the embedded sled store
//! - [`step`]: the generation-step contract and registry
//! - [`llm`]: the completion-service boundary

pub mod core;
pub mod llm;
pub mod quality;
pub mod refine;
pub mod stages;
pub mod state;
pub mod step;
pub mod workflow;

pub use crate::core::errors::{CaseflowError, Result};
pub use crate::core::limits::{CancelSignal, SafetyGuard, SafetyLimits, SafetyMetrics};
pub use crate::core::retry::{RetryExecutor, RetryPolicy};
pub use llm::{ChatMessage, Completion, CompletionParams, CompletionService};
pub use quality::{ArtifactAssessor, QualityAssessment, QualityAssessor, Rubric, RubricDimension};
pub use refine::{RefinementConfig, RefinementDriver, RefinementOutcome, RefinementRequest};
pub use stages::StageConfig;
pub use state::{
    ExecutionRecord, Session, SledStateStore, StateRepository, WorkflowState, WorkflowStatus,
};
pub use step::{GenerationStep, SchemaStep, StepInput, StepOutput, StepRegistry};
pub use workflow::{CircuitBreaker, WorkflowDag, WorkflowExecutor, WorkflowStage};

/// Install a process-wide tracing subscriber reading `RUST_LOG`. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
