//! Persistence boundary: sessions, workflow state, execution records and
//! append-only memory records. All shared mutable state crosses request
//! boundaries here and nowhere else.

pub mod sled_store;

pub use sled_store::SledStateStore;

use crate::core::errors::{CaseflowError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status shared by sessions and workflow executions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Initiated => "initiated",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "initiated" => Ok(WorkflowStatus::Initiated),
            "in_progress" => Ok(WorkflowStatus::InProgress),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(CaseflowError::configuration(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// Workflow progress for one session. Immutable by convention: every mutator
/// returns a new instance, so concurrent requests never observe each other's
/// in-flight copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub current_stage: String,
    pub status: WorkflowStatus,
    pub completed_stages: Vec<String>,
    /// Free-form accumulated context (always a JSON object)
    pub context: Value,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_count: u32,
    pub retry_count: u32,
}

impl WorkflowState {
    pub fn new(initial_stage: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            current_stage: initial_stage.into(),
            status: WorkflowStatus::Initiated,
            completed_stages: Vec::new(),
            context: Value::Object(serde_json::Map::new()),
            started_at: now,
            updated_at: now,
            error_count: 0,
            retry_count: 0,
        }
    }

    fn touched(mut self) -> Self {
        self.updated_at = Utc::now();
        self
    }

    pub fn with_status(&self, status: WorkflowStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.touched()
    }

    /// Move to a new current stage, recording the old one as completed.
    /// `completed_stages` never contains duplicates.
    pub fn advance_to(&self, stage: impl Into<String>) -> Self {
        let mut next = self.clone();
        let previous = std::mem::replace(&mut next.current_stage, stage.into());
        if !next.completed_stages.contains(&previous) {
            next.completed_stages.push(previous);
        }
        next.touched()
    }

    pub fn mark_stage_completed(&self, stage: impl Into<String>) -> Self {
        let mut next = self.clone();
        let stage = stage.into();
        if !next.completed_stages.contains(&stage) {
            next.completed_stages.push(stage);
        }
        next.touched()
    }

    pub fn with_context_entry(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        if let Value::Object(ref mut map) = next.context {
            map.insert(key.into(), value);
        }
        next.touched()
    }

    pub fn with_error_recorded(&self) -> Self {
        let mut next = self.clone();
        next.error_count += 1;
        next.touched()
    }

    pub fn with_retry_recorded(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next.touched()
    }
}

/// One interactive engagement. Created on first request; mutated only through
/// compare-and-swap updates; archived after a retention window, never deleted
/// while active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub state: WorkflowState,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

/// Persisted record of one workflow DAG execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub session_id: String,
    pub workflow: String,
    pub status: WorkflowStatus,
    pub current_stage: String,
    pub context: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        session_id: impl Into<String>,
        workflow: impl Into<String>,
        initial_stage: impl Into<String>,
        context: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: cuid2::create_id(),
            session_id: session_id.into(),
            workflow: workflow.into(),
            status: WorkflowStatus::Initiated,
            current_stage: initial_stage.into(),
            context,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Episodic,
    Semantic,
    Working,
    Procedural,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Working => "working",
            MemoryKind::Procedural => "procedural",
        }
    }
}

/// Append-only memory record keyed by session and kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub session_id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(
        session_id: impl Into<String>,
        kind: MemoryKind,
        content: impl Into<String>,
        importance: f32,
    ) -> Self {
        Self {
            id: cuid2::create_id(),
            session_id: session_id.into(),
            kind,
            content: content.into(),
            embedding: None,
            importance,
            created_at: Utc::now(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// The persistence contract the orchestration components depend on.
///
/// Session updates must go through `atomic_update`: read the current
/// `updated_at`, write conditionally on it being unchanged, and treat a
/// mismatch as a conflict, never last-write-wins.
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn create_session(&self, user_id: &str, initial_state: WorkflowState) -> Result<String>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    async fn get_state(&self, session_id: &str) -> Result<Option<WorkflowState>>;

    /// Unconditional write; reserved for the session's creator before any
    /// concurrent reader exists. Everyone else uses `atomic_update`.
    async fn save_state(&self, session_id: &str, state: WorkflowState) -> Result<()>;

    /// Compare-and-swap on the session's `updated_at`. Returns false on a
    /// conflict (the caller re-reads and decides).
    async fn atomic_update(
        &self,
        session_id: &str,
        expected_updated_at: DateTime<Utc>,
        new_state: WorkflowState,
    ) -> Result<bool>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>>;

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()>;

    async fn append_memory(&self, record: &MemoryRecord) -> Result<()>;

    async fn list_memories(&self, session_id: &str, kind: MemoryKind)
        -> Result<Vec<MemoryRecord>>;

    /// Archive sessions whose last update is older than the retention window.
    /// Returns the number of sessions archived.
    async fn purge_stale(&self, retention: chrono::Duration) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_completed_stages_never_duplicate() {
        let state = WorkflowState::new("opportunity");
        let state = state.mark_stage_completed("opportunity");
        let state = state.mark_stage_completed("opportunity");
        assert_eq!(state.completed_stages, vec!["opportunity".to_string()]);
    }

    #[test]
    fn test_advance_records_previous_stage() {
        let state = WorkflowState::new("opportunity");
        let state = state.advance_to("target");
        assert_eq!(state.current_stage, "target");
        assert_eq!(state.completed_stages, vec!["opportunity".to_string()]);

        // advancing back and forth must not duplicate
        let state = state.advance_to("opportunity").advance_to("target");
        assert_eq!(
            state.completed_stages,
            vec!["opportunity".to_string(), "target".to_string()]
        );
    }

    #[test]
    fn test_mutators_return_new_values() {
        let original = WorkflowState::new("opportunity");
        let modified = original.with_status(WorkflowStatus::InProgress);
        assert_eq!(original.status, WorkflowStatus::Initiated);
        assert_eq!(modified.status, WorkflowStatus::InProgress);
        assert!(modified.updated_at >= original.updated_at);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            WorkflowStatus::Initiated,
            WorkflowStatus::InProgress,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
        ] {
            assert_eq!(WorkflowStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(WorkflowStatus::from_str("bogus").is_err());
    }
}
