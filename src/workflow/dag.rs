//! Declarative stage graph. Each stage names an implementing step, carries a
//! timeout and an optional retry override, and points at most one successor.
//! A stage with no successor is terminal.

use crate::core::errors::{CaseflowError, Result};
use crate::core::retry::RetryPolicy;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStage {
    pub id: String,
    /// Registry name of the step this stage routes to
    pub step: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Overrides the executor's default retry policy for this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Unconditional transition edge; `None` marks a terminal stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl WorkflowStage {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDag {
    pub name: String,
    pub initial_stage: String,
    pub stages: Vec<WorkflowStage>,
}

impl WorkflowDag {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let dag: WorkflowDag = serde_yaml::from_str(yaml)?;
        dag.validate()?;
        Ok(dag)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Referential integrity only. Cycles are detected during traversal, so
    /// a structurally cyclic graph loads fine and fails at execution time;
    /// callers wanting the stronger guarantee use `ensure_acyclic`.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(CaseflowError::configuration("workflow has no stages"));
        }
        let mut seen = HashMap::new();
        for stage in &self.stages {
            if seen.insert(stage.id.as_str(), ()).is_some() {
                return Err(CaseflowError::configuration_field(
                    "duplicate stage id",
                    stage.id.clone(),
                ));
            }
            if stage.timeout_secs == 0 {
                return Err(CaseflowError::configuration_field(
                    "stage timeout must be greater than 0",
                    stage.id.clone(),
                ));
            }
            if let Some(retry) = &stage.retry {
                retry.validate()?;
            }
        }
        if !seen.contains_key(self.initial_stage.as_str()) {
            return Err(CaseflowError::configuration_field(
                "initial_stage is not a configured stage",
                self.initial_stage.clone(),
            ));
        }
        for stage in &self.stages {
            if let Some(next) = &stage.next {
                if !seen.contains_key(next.as_str()) {
                    return Err(CaseflowError::configuration_field(
                        format!("stage '{}' points at unconfigured stage '{next}'", stage.id),
                        next.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Load-time acyclicity check for callers that want to reject cyclic
    /// graphs before any execution starts.
    pub fn ensure_acyclic(&self) -> Result<()> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for stage in &self.stages {
            indices.insert(stage.id.as_str(), graph.add_node(stage.id.as_str()));
        }
        for stage in &self.stages {
            if let Some(next) = &stage.next {
                if let (Some(&from), Some(&to)) =
                    (indices.get(stage.id.as_str()), indices.get(next.as_str()))
                {
                    graph.add_edge(from, to, ());
                }
            }
        }
        if is_cyclic_directed(&graph) {
            return Err(CaseflowError::circular(
                self.initial_stage.clone(),
                "stage graph contains a cycle",
            ));
        }
        Ok(())
    }

    pub fn stage(&self, id: &str) -> Option<&WorkflowStage> {
        self.stages.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn linear_yaml() -> &'static str {
        r#"
name: value_case
initial_stage: profile
stages:
  - id: profile
    step: profile_step
    next: value_map
  - id: value_map
    step: value_map_step
    timeout_secs: 120
"#
    }

    #[test]
    fn test_loads_linear_graph() {
        let dag = WorkflowDag::from_yaml(linear_yaml()).unwrap();
        assert_eq!(dag.stages.len(), 2);
        assert_eq!(dag.stage("profile").unwrap().next.as_deref(), Some("value_map"));
        assert_eq!(dag.stage("value_map").unwrap().next, None);
        assert_eq!(dag.stage("profile").unwrap().timeout(), Duration::from_secs(60));
        assert!(dag.ensure_acyclic().is_ok());
    }

    #[test]
    fn test_rejects_dangling_next() {
        let result = WorkflowDag::from_yaml(
            r#"
name: broken
initial_stage: a
stages:
  - id: a
    step: s
    next: missing
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_unknown_initial_stage() {
        let result = WorkflowDag::from_yaml(
            r#"
name: broken
initial_stage: nope
stages:
  - id: a
    step: s
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_cyclic_graph_loads_but_fails_acyclicity_check() {
        let dag = WorkflowDag::from_yaml(
            r#"
name: looped
initial_stage: a
stages:
  - id: a
    step: s
    next: b
  - id: b
    step: s
    next: a
"#,
        )
        .unwrap();
        let err = dag.ensure_acyclic().unwrap_err();
        assert!(matches!(err, CaseflowError::CircularDependency { .. }));
    }

    #[test]
    fn test_rejects_duplicate_stage_ids() {
        let result = WorkflowDag::from_yaml(
            r#"
name: dup
initial_stage: a
stages:
  - id: a
    step: s
  - id: a
    step: s
"#,
        );
        assert!(result.is_err());
    }
}
