//! Embedded sled implementation of the state repository. Values are JSON
//! encoded; optimistic concurrency uses sled's compare_and_swap on the
//! serialized session bytes.

use crate::core::errors::{CaseflowError, Result};
use crate::state::{
    ExecutionRecord, MemoryKind, MemoryRecord, Session, StateRepository, WorkflowState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, info};

const SESSIONS_TREE: &str = "sessions";
const EXECUTIONS_TREE: &str = "executions";
const MEMORIES_TREE: &str = "memories";

pub struct SledStateStore {
    sessions: sled::Tree,
    executions: sled::Tree,
    memories: sled::Tree,
}

impl SledStateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            sessions: db.open_tree(SESSIONS_TREE)?,
            executions: db.open_tree(EXECUTIONS_TREE)?,
            memories: db.open_tree(MEMORIES_TREE)?,
        })
    }

    fn load_session(&self, session_id: &str) -> Result<Option<(Session, sled::IVec)>> {
        match self.sessions.get(session_id.as_bytes())? {
            Some(bytes) => {
                let session: Session = serde_json::from_slice(&bytes)?;
                Ok(Some((session, bytes)))
            }
            None => Ok(None),
        }
    }

    fn put_session(&self, session: &Session) -> Result<()> {
        let bytes = serde_json::to_vec(session)?;
        self.sessions
            .insert(session.session_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Memory keys sort by session, kind, then insertion time so listing is a
    /// single prefix scan in append order.
    fn memory_key(record: &MemoryRecord) -> String {
        format!(
            "{}/{}/{:020}/{}",
            record.session_id,
            record.kind.as_str(),
            record.created_at.timestamp_nanos_opt().unwrap_or(0),
            record.id
        )
    }
}

#[async_trait]
impl StateRepository for SledStateStore {
    async fn create_session(&self, user_id: &str, initial_state: WorkflowState) -> Result<String> {
        let session = Session {
            session_id: cuid2::create_id(),
            user_id: user_id.to_string(),
            state: initial_state,
            archived: false,
            created_at: Utc::now(),
        };
        self.put_session(&session)?;
        self.sessions.flush_async().await?;
        info!(session_id = %session.session_id, user_id, "created session");
        Ok(session.session_id)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.load_session(session_id)?.map(|(session, _)| session))
    }

    async fn get_state(&self, session_id: &str) -> Result<Option<WorkflowState>> {
        Ok(self
            .load_session(session_id)?
            .map(|(session, _)| session.state))
    }

    async fn save_state(&self, session_id: &str, state: WorkflowState) -> Result<()> {
        let (mut session, _) = self
            .load_session(session_id)?
            .ok_or_else(|| CaseflowError::internal(format!("session not found: {session_id}")))?;
        session.state = state;
        session.state.updated_at = Utc::now();
        self.put_session(&session)?;
        self.sessions.flush_async().await?;
        Ok(())
    }

    async fn atomic_update(
        &self,
        session_id: &str,
        expected_updated_at: DateTime<Utc>,
        new_state: WorkflowState,
    ) -> Result<bool> {
        let Some((current, old_bytes)) = self.load_session(session_id)? else {
            return Err(CaseflowError::internal(format!(
                "session not found: {session_id}"
            )));
        };

        if current.state.updated_at != expected_updated_at {
            debug!(
                session_id,
                expected = %expected_updated_at,
                actual = %current.state.updated_at,
                "atomic update rejected: stale updated_at"
            );
            return Ok(false);
        }

        let mut next = current;
        next.state = new_state;
        next.state.updated_at = Utc::now();
        let new_bytes = serde_json::to_vec(&next)?;

        let swapped = self
            .sessions
            .compare_and_swap(
                session_id.as_bytes(),
                Some(old_bytes),
                Some(new_bytes),
            )?
            .is_ok();
        if swapped {
            self.sessions.flush_async().await?;
        }
        Ok(swapped)
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        match self.executions.get(execution_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut stamped = record.clone();
        stamped.updated_at = Utc::now();
        let bytes = serde_json::to_vec(&stamped)?;
        self.executions
            .insert(record.execution_id.as_bytes(), bytes)?;
        self.executions.flush_async().await?;
        Ok(())
    }

    async fn append_memory(&self, record: &MemoryRecord) -> Result<()> {
        let key = Self::memory_key(record);
        let bytes = serde_json::to_vec(record)?;
        self.memories.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    async fn list_memories(
        &self,
        session_id: &str,
        kind: MemoryKind,
    ) -> Result<Vec<MemoryRecord>> {
        let prefix = format!("{}/{}/", session_id, kind.as_str());
        let mut records = Vec::new();
        for entry in self.memories.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry?;
            records.push(serde_json::from_slice(&bytes)?);
        }
        Ok(records)
    }

    async fn purge_stale(&self, retention: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - retention;
        let mut archived = 0usize;

        for entry in self.sessions.iter() {
            let (key, bytes) = entry?;
            let mut session: Session = serde_json::from_slice(&bytes)?;
            if !session.archived
                && session.state.status.is_terminal()
                && session.state.updated_at < cutoff
            {
                session.archived = true;
                self.sessions.insert(key, serde_json::to_vec(&session)?)?;
                archived += 1;
            }
        }

        if archived > 0 {
            self.sessions.flush_async().await?;
            info!(archived, "archived stale sessions");
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowStatus;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn open_store() -> (SledStateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SledStateStore::open(dir.path().join("state.db")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (store, _dir) = open_store();

        let session_id = store
            .create_session("user_1", WorkflowState::new("opportunity"))
            .await
            .unwrap();

        let state = store.get_state(&session_id).await.unwrap().unwrap();
        assert_eq!(state.current_stage, "opportunity");
        assert_eq!(state.status, WorkflowStatus::Initiated);

        assert!(store.get_state("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_atomic_update_rejects_stale_writer() {
        let (store, _dir) = open_store();
        let session_id = store
            .create_session("user_1", WorkflowState::new("opportunity"))
            .await
            .unwrap();

        let state = store.get_state(&session_id).await.unwrap().unwrap();

        // First writer wins
        let updated = store
            .atomic_update(
                &session_id,
                state.updated_at,
                state.with_status(WorkflowStatus::InProgress),
            )
            .await
            .unwrap();
        assert!(updated);

        // Second writer with the stale timestamp is rejected, not overwritten
        let conflicting = store
            .atomic_update(
                &session_id,
                state.updated_at,
                state.with_status(WorkflowStatus::Failed),
            )
            .await
            .unwrap();
        assert!(!conflicting);

        let current = store.get_state(&session_id).await.unwrap().unwrap();
        assert_eq!(current.status, WorkflowStatus::InProgress);
    }

    #[tokio::test]
    async fn test_execution_record_round_trip() {
        let (store, _dir) = open_store();

        let record = ExecutionRecord::new(
            "sess_1",
            "value_case",
            "opportunity",
            serde_json::json!({}),
        );
        store.save_execution(&record).await.unwrap();

        let loaded = store
            .get_execution(&record.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.workflow, "value_case");
        assert_eq!(loaded.status, WorkflowStatus::Initiated);
    }

    #[tokio::test]
    async fn test_memories_scoped_by_session_and_kind() {
        let (store, _dir) = open_store();

        store
            .append_memory(&MemoryRecord::new(
                "sess_1",
                MemoryKind::Episodic,
                "customer mentioned churn risk",
                0.8,
            ))
            .await
            .unwrap();
        store
            .append_memory(&MemoryRecord::new(
                "sess_1",
                MemoryKind::Semantic,
                "industry: logistics",
                0.5,
            ))
            .await
            .unwrap();
        store
            .append_memory(&MemoryRecord::new(
                "sess_2",
                MemoryKind::Episodic,
                "other session",
                0.2,
            ))
            .await
            .unwrap();

        let episodic = store
            .list_memories("sess_1", MemoryKind::Episodic)
            .await
            .unwrap();
        assert_eq!(episodic.len(), 1);
        assert_eq!(episodic[0].content, "customer mentioned churn risk");

        let semantic = store
            .list_memories("sess_1", MemoryKind::Semantic)
            .await
            .unwrap();
        assert_eq!(semantic.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_archives_only_terminal_stale_sessions() {
        let (store, _dir) = open_store();

        let done = store
            .create_session("user_1", WorkflowState::new("opportunity"))
            .await
            .unwrap();
        let state = store.get_state(&done).await.unwrap().unwrap();
        store
            .save_state(&done, state.with_status(WorkflowStatus::Completed))
            .await
            .unwrap();

        let active = store
            .create_session("user_2", WorkflowState::new("opportunity"))
            .await
            .unwrap();

        // Zero retention archives everything eligible immediately
        let archived = store.purge_stale(chrono::Duration::zero()).await.unwrap();
        assert_eq!(archived, 1);

        let done_session = store.get_session(&done).await.unwrap().unwrap();
        assert!(done_session.archived);
        let active_session = store.get_session(&active).await.unwrap().unwrap();
        assert!(!active_session.archived);
    }
}
