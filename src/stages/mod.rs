//! Deterministic lifecycle state machine. Pure keyword/confidence routing:
//! no I/O, no side effects, same inputs always give the same answer.

use crate::core::errors::{CaseflowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Signals that fire one transition. User keywords are matched against the
/// user's text, response keywords against the generated text; either set
/// matching fires the trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTrigger {
    #[serde(default)]
    pub user_keywords: Vec<String>,
    #[serde(default)]
    pub response_keywords: Vec<String>,
    /// Transitions gated by confidence are skipped entirely when the observed
    /// confidence is below this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f32>,
}

impl StageTrigger {
    fn matches(&self, user_text: &str, generated_text: &str, confidence: f32) -> bool {
        if let Some(min) = self.min_confidence {
            if confidence < min {
                return false;
            }
        }
        let user_text = user_text.to_lowercase();
        let generated_text = generated_text.to_lowercase();
        self.user_keywords
            .iter()
            .any(|k| user_text.contains(&k.to_lowercase()))
            || self
                .response_keywords
                .iter()
                .any(|k| generated_text.contains(&k.to_lowercase()))
    }
}

/// One allowed transition out of a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub to: String,
    #[serde(flatten)]
    pub trigger: StageTrigger,
}

/// A named lifecycle stage and its outgoing transitions. A stage with no
/// transitions is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub transitions: Vec<StageTransition>,
}

/// Static, declarative stage map. Read-only at runtime. Transition order
/// within a stage is the explicit precedence: when several transitions'
/// keywords overlap, the first declared one wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub stages: Vec<StageSpec>,
}

impl StageConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: StageConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Every transition target must name a configured stage, and stage names
    /// must be unique.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(CaseflowError::configuration_field(
                    "duplicate stage name",
                    stage.name.clone(),
                ));
            }
        }
        for stage in &self.stages {
            for transition in &stage.transitions {
                if !names.contains(transition.to.as_str()) {
                    return Err(CaseflowError::configuration_field(
                        format!(
                            "stage '{}' transitions to unconfigured stage '{}'",
                            stage.name, transition.to
                        ),
                        transition.to.clone(),
                    ));
                }
                if let Some(min) = transition.trigger.min_confidence {
                    if !(0.0..=1.0).contains(&min) {
                        return Err(CaseflowError::configuration_field(
                            "min_confidence must be within 0.0..=1.0",
                            transition.to.clone(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s.name == stage)
    }

    fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Decide the next stage for the observed texts and confidence.
    ///
    /// Transitions are tried in declaration order; the first whose trigger
    /// fires wins. Returns `None` when nothing fires or the current stage is
    /// terminal. Calling with a stage that is not configured is a contract
    /// violation and fails with `UnknownStage`, never a silent `None`.
    pub fn decide_next_stage(
        &self,
        current: &str,
        user_text: &str,
        generated_text: &str,
        confidence: f32,
    ) -> Result<Option<String>> {
        let stage = self
            .stage(current)
            .ok_or_else(|| CaseflowError::unknown_stage(current))?;

        for transition in &stage.transitions {
            if transition
                .trigger
                .matches(user_text, generated_text, confidence)
            {
                debug!(from = current, to = %transition.to, "stage transition fired");
                return Ok(Some(transition.to.clone()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lifecycle() -> StageConfig {
        StageConfig::from_yaml(
            r#"
stages:
  - name: opportunity
    transitions:
      - to: target
        response_keywords: ["ready to target"]
        min_confidence: 0.7
  - name: target
    transitions:
      - to: realization
        user_keywords: ["proceed"]
      - to: opportunity
        user_keywords: ["start over"]
  - name: realization
    transitions:
      - to: expansion
        user_keywords: ["expand"]
        response_keywords: ["value realized"]
  - name: expansion
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let config = lifecycle();
        let next = config
            .decide_next_stage("target", "Please PROCEED with the plan", "", 1.0)
            .unwrap();
        assert_eq!(next, Some("realization".to_string()));
    }

    #[test]
    fn test_confidence_gate_blocks_matching_keyword() {
        let config = lifecycle();
        // Keyword matches but confidence 0.5 is below the 0.7 gate
        let next = config
            .decide_next_stage("opportunity", "", "We are ready to target accounts", 0.5)
            .unwrap();
        assert_eq!(next, None);

        let next = config
            .decide_next_stage("opportunity", "", "We are ready to target accounts", 0.7)
            .unwrap();
        assert_eq!(next, Some("target".to_string()));
    }

    #[test]
    fn test_response_keywords_match_generated_text_only() {
        let config = lifecycle();
        // "ready to target" in the user text must not fire a response trigger
        let next = config
            .decide_next_stage("opportunity", "ready to target", "", 1.0)
            .unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_first_declared_transition_wins() {
        let config = StageConfig::from_yaml(
            r#"
stages:
  - name: a
    transitions:
      - to: b
        user_keywords: ["go"]
      - to: c
        user_keywords: ["go"]
  - name: b
  - name: c
"#,
        )
        .unwrap();
        let next = config.decide_next_stage("a", "go", "", 1.0).unwrap();
        assert_eq!(next, Some("b".to_string()));
    }

    #[test]
    fn test_terminal_stage_yields_none() {
        let config = lifecycle();
        let next = config
            .decide_next_stage("expansion", "expand more", "anything", 1.0)
            .unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_unknown_stage_is_an_error() {
        let config = lifecycle();
        let err = config
            .decide_next_stage("negotiation", "", "", 1.0)
            .unwrap_err();
        assert!(matches!(err, CaseflowError::UnknownStage { .. }));
    }

    #[test]
    fn test_decision_is_deterministic() {
        let config = lifecycle();
        let first = config
            .decide_next_stage("realization", "let us expand", "value realized", 0.9)
            .unwrap();
        for _ in 0..10 {
            let again = config
                .decide_next_stage("realization", "let us expand", "value realized", 0.9)
                .unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_validate_rejects_dangling_target() {
        let result = StageConfig::from_yaml(
            r#"
stages:
  - name: a
    transitions:
      - to: missing
        user_keywords: ["go"]
"#,
        );
        assert!(matches!(
            result,
            Err(CaseflowError::Configuration { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_stage() {
        let result = StageConfig::from_yaml(
            r#"
stages:
  - name: a
  - name: a
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        let result = StageConfig::from_yaml(
            r#"
stages:
  - name: a
    transitions:
      - to: a
        user_keywords: ["loop"]
        min_confidence: 1.5
"#,
        );
        assert!(result.is_err());
    }
}
