//! Quality gate: scores a produced artifact against the fixed six-dimension
//! rubric and decides whether the refinement loop runs again.

use crate::core::errors::{CaseflowError, Result};
use crate::llm::{ChatMessage, CompletionParams, CompletionService, CompletionUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// The six fixed rubric dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RubricDimension {
    Traceability,
    Relevance,
    Realism,
    Clarity,
    Actionability,
    Polish,
}

impl RubricDimension {
    pub const ALL: [RubricDimension; 6] = [
        RubricDimension::Traceability,
        RubricDimension::Relevance,
        RubricDimension::Realism,
        RubricDimension::Clarity,
        RubricDimension::Actionability,
        RubricDimension::Polish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RubricDimension::Traceability => "traceability",
            RubricDimension::Relevance => "relevance",
            RubricDimension::Realism => "realism",
            RubricDimension::Clarity => "clarity",
            RubricDimension::Actionability => "actionability",
            RubricDimension::Polish => "polish",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.as_str() == s)
    }
}

/// Per-dimension maxima and the pass threshold. Read-only at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rubric {
    pub maxima: BTreeMap<RubricDimension, u32>,
    pub threshold: u32,
}

impl Default for Rubric {
    fn default() -> Self {
        let maxima = RubricDimension::ALL.iter().map(|d| (*d, 3)).collect();
        Self {
            maxima,
            threshold: 14,
        }
    }
}

impl Rubric {
    /// JSON Schema for the evaluator response, with per-dimension score
    /// bounds taken from the maxima.
    fn response_schema(&self) -> Value {
        let mut score_props = serde_json::Map::new();
        let mut required = Vec::new();
        for dimension in RubricDimension::ALL {
            score_props.insert(
                dimension.as_str().to_string(),
                serde_json::json!({
                    "type": "integer",
                    "minimum": 0,
                    "maximum": self.maxima[&dimension],
                }),
            );
            required.push(dimension.as_str());
        }
        serde_json::json!({
            "type": "object",
            "properties": {
                "scores": {
                    "type": "object",
                    "properties": score_props,
                    "required": required,
                    "additionalProperties": false,
                },
                "feedback": {"type": "string"},
                "suggestions": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["scores", "feedback"],
            "additionalProperties": false,
        })
    }

    pub fn validate(&self) -> Result<()> {
        for dimension in RubricDimension::ALL {
            match self.maxima.get(&dimension) {
                Some(0) => {
                    return Err(CaseflowError::configuration_field(
                        "rubric maxima must be greater than 0",
                        dimension.as_str(),
                    ))
                }
                Some(_) => {}
                None => {
                    return Err(CaseflowError::configuration_field(
                        "rubric is missing a dimension maximum",
                        dimension.as_str(),
                    ))
                }
            }
        }
        if self.threshold > self.max_total() {
            return Err(CaseflowError::configuration_field(
                "threshold exceeds the maximum attainable score",
                "threshold",
            ));
        }
        Ok(())
    }

    pub fn max_total(&self) -> u32 {
        self.maxima.values().sum()
    }
}

/// Scored snapshot of one artifact against the rubric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub scores: BTreeMap<RubricDimension, u32>,
    pub total_score: u32,
    pub threshold: u32,
    pub needs_refinement: bool,
    pub feedback: String,
    pub suggestions: Vec<String>,
    pub usage: CompletionUsage,
}

/// Strict wire shape of the evaluator response. Unknown fields are rejected;
/// missing or out-of-range scores fail the call.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAssessment {
    scores: BTreeMap<String, u32>,
    feedback: String,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Decides whether a produced artifact is good enough to stop iterating
pub struct QualityAssessor {
    completion: Arc<dyn CompletionService>,
    rubric: Rubric,
    schema: jsonschema::Validator,
    params: CompletionParams,
}

impl QualityAssessor {
    pub fn new(completion: Arc<dyn CompletionService>, rubric: Rubric) -> Result<Self> {
        rubric.validate()?;
        let schema = jsonschema::validator_for(&rubric.response_schema()).map_err(|e| {
            CaseflowError::configuration(format!("invalid assessment schema: {e}"))
        })?;
        Ok(Self {
            completion,
            rubric,
            schema,
            params: CompletionParams::default(),
        })
    }

    pub fn with_params(mut self, params: CompletionParams) -> Self {
        self.params = params;
        self
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    fn evaluation_instructions(&self) -> String {
        let dimensions = RubricDimension::ALL
            .iter()
            .map(|d| format!("{} (0..={})", d.as_str(), self.rubric.maxima[d]))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "You evaluate a business value case artifact. Score each dimension: {dimensions}. \
             Respond with JSON only, shaped as \
             {{\"scores\": {{<dimension>: <integer>}}, \"feedback\": <string>, \"suggestions\": [<string>]}}."
        )
    }

    fn parse(&self, content: &str, usage: CompletionUsage) -> Result<QualityAssessment> {
        let value: Value = serde_json::from_str(content.trim()).map_err(|e| {
            CaseflowError::schema("quality_assessment", format!("malformed evaluation: {e}"))
        })?;
        if let Err(err) = self.schema.validate(&value) {
            return Err(CaseflowError::schema(
                "quality_assessment",
                format!("evaluation violates the rubric schema: {err}"),
            ));
        }
        let raw: RawAssessment = serde_json::from_value(value).map_err(|e| {
            CaseflowError::schema("quality_assessment", format!("malformed evaluation: {e}"))
        })?;

        let mut scores = BTreeMap::new();
        for (name, score) in &raw.scores {
            let dimension = RubricDimension::from_str(name).ok_or_else(|| {
                CaseflowError::schema(
                    "quality_assessment",
                    format!("unknown rubric dimension: {name}"),
                )
            })?;
            scores.insert(dimension, *score);
        }

        let total_score: u32 = scores.values().sum();
        let needs_refinement = total_score < self.rubric.threshold;
        debug!(
            total_score,
            threshold = self.rubric.threshold,
            needs_refinement,
            "assessed artifact"
        );

        Ok(QualityAssessment {
            scores,
            total_score,
            threshold: self.rubric.threshold,
            needs_refinement,
            feedback: raw.feedback,
            suggestions: raw.suggestions,
            usage,
        })
    }

    /// Request a structured evaluation of the artifact. A malformed or
    /// unparsable evaluation is a hard failure of this call; it never
    /// defaults to "needs refinement" or "passed".
    pub async fn assess(&self, artifact: &Value) -> Result<QualityAssessment> {
        self.assess_with_history(artifact, &[]).await
    }

    /// Like `assess`, with prior-iteration feedback included so the evaluator
    /// can judge whether earlier criticism was addressed.
    pub async fn assess_with_history(
        &self,
        artifact: &Value,
        feedback_history: &[String],
    ) -> Result<QualityAssessment> {
        let mut messages = vec![ChatMessage::system(self.evaluation_instructions())];
        for feedback in feedback_history {
            messages.push(ChatMessage::assistant(feedback.clone()));
        }
        messages.push(ChatMessage::user(artifact.to_string()));
        let completion = self.completion.complete(&messages, &self.params).await?;
        self.parse(&completion.content, completion.usage())
    }
}

/// Seam for tests and alternative gating strategies
#[async_trait]
pub trait ArtifactAssessor: Send + Sync {
    async fn assess(&self, artifact: &Value) -> Result<QualityAssessment>;
}

#[async_trait]
impl ArtifactAssessor for QualityAssessor {
    async fn assess(&self, artifact: &Value) -> Result<QualityAssessment> {
        QualityAssessor::assess(self, artifact).await
    }
}
