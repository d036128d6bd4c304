//! Bounded generate, evaluate, refine loop. Runs an ordered sequence of
//! generation steps, scores the assembled artifact, and repeats until the
//! quality gate passes or the iteration budget runs out. Persists after every
//! iteration so an interrupted loop resumes from its last good state.

use crate::core::errors::{CaseflowError, Result};
use crate::core::limits::{SafetyGuard, SafetyLimits, SafetyMetrics};
use crate::core::retry::{RetryExecutor, RetryPolicy};
use crate::llm::CompletionUsage;
use crate::quality::{ArtifactAssessor, QualityAssessment};
use crate::state::{StateRepository, WorkflowState, WorkflowStatus};
use crate::step::{StepInput, StepRegistry};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Conflicting writers get this many chances to reapply on fresh state before
/// the update fails outright.
const CAS_REAPPLY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RefinementConfig {
    pub max_iterations: u32,
    pub safety: SafetyLimits,
    pub retry: RetryPolicy,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            safety: SafetyLimits::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RefinementConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(CaseflowError::configuration_field(
                "max_iterations must be greater than 0",
                "max_iterations",
            ));
        }
        self.safety.validate()?;
        self.retry.validate()
    }
}

/// One loop invocation: either resume an existing session or start fresh
#[derive(Debug, Clone)]
pub struct RefinementRequest {
    pub session_id: Option<String>,
    pub user_id: String,
    pub initial_stage: String,
    pub context: Value,
}

impl RefinementRequest {
    pub fn new(user_id: impl Into<String>, initial_stage: impl Into<String>) -> Self {
        Self {
            session_id: None,
            user_id: user_id.into(),
            initial_stage: initial_stage.into(),
            context: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// Aggregated accounting across all iterations of one loop
#[derive(Debug, Clone, Default)]
pub struct RefinementMetrics {
    pub iterations: u32,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
}

/// Final artifact plus everything a caller needs to audit the loop
#[derive(Debug)]
pub struct RefinementOutcome {
    pub session_id: String,
    pub artifact: Value,
    pub assessment: QualityAssessment,
    pub metrics: RefinementMetrics,
    pub safety: SafetyMetrics,
}

/// Orchestrates the refinement loop. Holds no per-request state; every run
/// gets its own safety guard and works on state loaded from the repository,
/// so concurrent runs never observe each other.
pub struct RefinementDriver {
    registry: Arc<StepRegistry>,
    sequence: Vec<String>,
    assessor: Arc<dyn ArtifactAssessor>,
    repo: Arc<dyn StateRepository>,
    retry: RetryExecutor,
    config: RefinementConfig,
}

impl RefinementDriver {
    pub fn new(
        registry: Arc<StepRegistry>,
        sequence: Vec<String>,
        assessor: Arc<dyn ArtifactAssessor>,
        repo: Arc<dyn StateRepository>,
        config: RefinementConfig,
    ) -> Result<Self> {
        config.validate()?;
        if sequence.is_empty() {
            return Err(CaseflowError::configuration(
                "refinement needs at least one generation step",
            ));
        }
        for name in &sequence {
            if !registry.contains(name) {
                return Err(CaseflowError::step_not_found(name));
            }
        }
        let retry = RetryExecutor::new(config.retry.clone())?;
        Ok(Self {
            registry,
            sequence,
            assessor,
            repo,
            retry,
            config,
        })
    }

    /// Apply a state mutation through compare-and-swap, reloading and
    /// reapplying on conflict a bounded number of times.
    async fn persist<F>(&self, session_id: &str, apply: F) -> Result<WorkflowState>
    where
        F: Fn(&WorkflowState) -> WorkflowState,
    {
        for _ in 0..CAS_REAPPLY_ATTEMPTS {
            let current = self
                .repo
                .get_state(session_id)
                .await?
                .ok_or_else(|| CaseflowError::internal(format!("session not found: {session_id}")))?;
            let next = apply(&current);
            if self
                .repo
                .atomic_update(session_id, current.updated_at, next.clone())
                .await?
            {
                return Ok(next);
            }
        }
        Err(CaseflowError::conflict(session_id))
    }

    async fn resolve_session(&self, request: &RefinementRequest) -> Result<String> {
        match &request.session_id {
            Some(session_id) => {
                self.repo.get_session(session_id).await?.ok_or_else(|| {
                    CaseflowError::internal(format!("session not found: {session_id}"))
                })?;
                Ok(session_id.clone())
            }
            None => {
                let mut state = WorkflowState::new(request.initial_stage.clone());
                state.context = request.context.clone();
                self.repo.create_session(&request.user_id, state).await
            }
        }
    }

    /// Run the loop to completion. A Safety Violation anywhere inside an
    /// iteration aborts the whole loop and propagates unmodified; it is not
    /// a failed iteration to retry.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn run(&self, request: RefinementRequest) -> Result<RefinementOutcome> {
        let session_id = self.resolve_session(&request).await?;
        let guard = SafetyGuard::new(self.config.safety.clone())?;
        guard.start();

        let result = self.run_loop(&session_id, &guard).await;
        let safety = guard.complete();

        match result {
            Ok((artifact, assessment, metrics)) => {
                self.persist(&session_id, |state| {
                    state.with_status(WorkflowStatus::Completed)
                })
                .await?;
                info!(
                    session_id,
                    iterations = metrics.iterations,
                    total_score = assessment.total_score,
                    "refinement completed"
                );
                Ok(RefinementOutcome {
                    session_id,
                    artifact,
                    assessment,
                    metrics,
                    safety,
                })
            }
            Err(err) => {
                warn!(session_id, error = %err, "refinement failed");
                // Best effort: a conflict here must not mask the real error
                let _ = self
                    .persist(&session_id, |state| {
                        state
                            .with_error_recorded()
                            .with_status(WorkflowStatus::Failed)
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn run_loop(
        &self,
        session_id: &str,
        guard: &SafetyGuard,
    ) -> Result<(Value, QualityAssessment, RefinementMetrics)> {
        let mut feedback: Option<String> = None;
        let mut metrics = RefinementMetrics::default();
        let mut usage = CompletionUsage::default();
        let mut last_assessment: Option<QualityAssessment> = None;
        let retried_calls = AtomicU32::new(0);

        let state = self
            .repo
            .get_state(session_id)
            .await?
            .ok_or_else(|| CaseflowError::internal(format!("session not found: {session_id}")))?;
        let context = state.context.clone();

        // A resumed session picks up the artifact it already produced instead
        // of regenerating from scratch
        let mut artifact = state
            .context
            .get("artifact")
            .filter(|value| value.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        while metrics.iterations < self.config.max_iterations {
            metrics.iterations += 1;
            guard.check_deadline()?;
            guard.check_memory_usage()?;

            for name in &self.sequence {
                let step = self.registry.get(name)?;
                let mut input = StepInput::new(artifact.clone(), context.clone());
                if let Some(feedback) = &feedback {
                    input = input.with_feedback(feedback.clone());
                }
                let output = self
                    .retry
                    .execute(name, |attempt| {
                        let step = step.clone();
                        let input = input.clone();
                        let retried_calls = &retried_calls;
                        async move {
                            if attempt > 1 {
                                retried_calls.fetch_add(1, Ordering::SeqCst);
                            }
                            guard.check_deadline()?;
                            guard.record_call()?;
                            let _depth = guard.enter_recursion()?;
                            step.execute(session_id, &input).await
                        }
                    })
                    .await?;

                usage.add(output.usage());
                if let Value::Object(ref mut map) = artifact {
                    map.insert(step.output_key().to_string(), output.data);
                }
            }

            let assessment = self
                .retry
                .execute("assess_artifact", |attempt| {
                    let artifact = artifact.clone();
                    let retried_calls = &retried_calls;
                    async move {
                        if attempt > 1 {
                            retried_calls.fetch_add(1, Ordering::SeqCst);
                        }
                        guard.check_deadline()?;
                        guard.record_call()?;
                        self.assessor.assess(&artifact).await
                    }
                })
                .await?;
            usage.add(assessment.usage);

            // Persist the iteration before deciding whether to continue so a
            // dropped connection stalls progress instead of losing it
            let iteration = metrics.iterations;
            let artifact_snapshot = artifact.clone();
            let assessment_snapshot = json!({
                "iteration": iteration,
                "total_score": assessment.total_score,
                "threshold": assessment.threshold,
                "needs_refinement": assessment.needs_refinement,
            });
            let retries = retried_calls.swap(0, Ordering::SeqCst);
            self.persist(session_id, |state| {
                let mut next = state
                    .with_status(WorkflowStatus::InProgress)
                    .with_context_entry("artifact", artifact_snapshot.clone())
                    .with_context_entry("last_assessment", assessment_snapshot.clone());
                for _ in 0..retries {
                    next = next.with_retry_recorded();
                }
                next
            })
            .await?;

            info!(
                session_id,
                iteration,
                total_score = assessment.total_score,
                needs_refinement = assessment.needs_refinement,
                "iteration assessed"
            );

            let done = !assessment.needs_refinement;
            feedback = Some(assessment.feedback.clone());
            last_assessment = Some(assessment);
            if done {
                break;
            }
        }

        // max_iterations >= 1, so at least one assessment exists here
        let assessment = last_assessment
            .ok_or_else(|| CaseflowError::internal("refinement loop produced no assessment"))?;
        metrics.total_tokens = usage.tokens_used;
        metrics.total_latency_ms = usage.latency_ms;
        Ok((artifact, assessment, metrics))
    }
}
