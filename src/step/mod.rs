//! Generation step ("agent") contract and the process-wide step registry.
//!
//! Steps turn structured input into structured output via the completion
//! service. They must not hold cross-call mutable state; everything a step
//! needs arrives in its input.

use crate::core::errors::{CaseflowError, Result};
use crate::llm::{ChatMessage, Completion, CompletionParams, CompletionService, CompletionUsage};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Input handed to a generation step on each invocation
#[derive(Debug, Clone)]
pub struct StepInput {
    /// The artifact assembled so far in this iteration
    pub artifact: Value,
    /// Assessor feedback from the previous iteration, if any
    pub feedback: Option<String>,
    /// Session context carried across iterations
    pub context: Value,
}

impl StepInput {
    pub fn new(artifact: Value, context: Value) -> Self {
        Self {
            artifact,
            feedback: None,
            context,
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }
}

/// Structured result of one step invocation
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub data: Value,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

impl StepOutput {
    pub fn usage(&self) -> CompletionUsage {
        CompletionUsage {
            tokens_used: self.tokens_used,
            latency_ms: self.latency_ms,
        }
    }
}

/// A specialized generation unit
#[async_trait]
pub trait GenerationStep: Send + Sync {
    /// Registry name of this step
    fn name(&self) -> &str;

    /// Key under which the step's output merges into the artifact
    fn output_key(&self) -> &str;

    async fn execute(&self, session_id: &str, input: &StepInput) -> Result<StepOutput>;
}

/// Process-wide cache of registered step implementations. The only shared
/// object in the engine; read-only after `freeze()`.
#[derive(Default)]
pub struct StepRegistry {
    steps: DashMap<String, Arc<dyn GenerationStep>>,
    frozen: AtomicBool,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, step: Arc<dyn GenerationStep>) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(CaseflowError::configuration(
                "step registry is frozen; register steps during initialization",
            ));
        }
        let name = step.name().to_string();
        if self.steps.contains_key(&name) {
            return Err(CaseflowError::configuration(format!(
                "step already registered: {name}"
            )));
        }
        debug!(step = %name, "registered generation step");
        self.steps.insert(name, step);
        Ok(())
    }

    /// Seal the registry; all registration after this point fails
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn GenerationStep>> {
        self.steps
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CaseflowError::step_not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Reusable completion-backed step: sends configured role-tagged messages
/// plus the serialized input, parses the response as JSON and validates it
/// against an explicit schema. Malformed model output fails the call; it is
/// never coerced into a valid-looking value.
pub struct SchemaStep {
    name: String,
    output_key: String,
    instructions: String,
    params: CompletionParams,
    schema: jsonschema::Validator,
    completion: Arc<dyn CompletionService>,
}

impl SchemaStep {
    pub fn new(
        name: impl Into<String>,
        output_key: impl Into<String>,
        instructions: impl Into<String>,
        output_schema: &Value,
        params: CompletionParams,
        completion: Arc<dyn CompletionService>,
    ) -> Result<Self> {
        let schema = jsonschema::validator_for(output_schema).map_err(|e| {
            CaseflowError::configuration(format!("invalid step output schema: {e}"))
        })?;
        Ok(Self {
            name: name.into(),
            output_key: output_key.into(),
            instructions: instructions.into(),
            params,
            schema,
            completion,
        })
    }

    fn parse_and_validate(&self, completion: &Completion) -> Result<Value> {
        let value: Value = serde_json::from_str(completion.content.trim()).map_err(|e| {
            CaseflowError::schema(self.name.clone(), format!("response is not JSON: {e}"))
        })?;
        if let Err(err) = self.schema.validate(&value) {
            return Err(CaseflowError::schema(
                self.name.clone(),
                format!("response violates output schema: {err}"),
            ));
        }
        Ok(value)
    }
}

#[async_trait]
impl GenerationStep for SchemaStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_key(&self) -> &str {
        &self.output_key
    }

    async fn execute(&self, session_id: &str, input: &StepInput) -> Result<StepOutput> {
        let request = serde_json::json!({
            "session_id": session_id,
            "artifact": input.artifact,
            "context": input.context,
            "feedback": input.feedback,
        });
        let messages = vec![
            ChatMessage::system(self.instructions.clone()),
            ChatMessage::user(request.to_string()),
        ];

        let completion = self.completion.complete(&messages, &self.params).await?;
        let data = self.parse_and_validate(&completion)?;

        Ok(StepOutput {
            data,
            tokens_used: completion.tokens_used,
            latency_ms: completion.latency_ms,
        })
    }
}
