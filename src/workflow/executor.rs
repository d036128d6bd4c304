//! Walks a stage graph end to end. Every transition writes the execution
//! record before proceeding, so a crash between stages leaves a resumable,
//! inspectable record instead of silent loss.

use crate::core::errors::{CaseflowError, Result};
use crate::core::retry::{RetryExecutor, RetryPolicy};
use crate::state::{ExecutionRecord, StateRepository, WorkflowStatus};
use crate::step::{StepInput, StepOutput, StepRegistry};
use crate::workflow::breaker::CircuitBreaker;
use crate::workflow::dag::{WorkflowDag, WorkflowStage};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct WorkflowExecutor {
    registry: Arc<StepRegistry>,
    repo: Arc<dyn StateRepository>,
    breaker: Arc<CircuitBreaker>,
    default_retry: RetryPolicy,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<StepRegistry>, repo: Arc<dyn StateRepository>) -> Self {
        Self {
            registry,
            repo,
            breaker: Arc::new(CircuitBreaker::default()),
            default_retry: RetryPolicy::default(),
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Execute the graph from its initial stage until a terminal stage or a
    /// fatal failure. Exhausting a stage's retries fails the whole execution;
    /// there is no partial-success state.
    #[instrument(skip(self, dag, initial_context), fields(workflow = %dag.name))]
    pub async fn execute(
        &self,
        dag: &WorkflowDag,
        session_id: &str,
        initial_context: Value,
    ) -> Result<ExecutionRecord> {
        dag.validate()?;

        let mut record =
            ExecutionRecord::new(session_id, &dag.name, &dag.initial_stage, initial_context);
        self.repo.save_execution(&record).await?;

        record.status = WorkflowStatus::InProgress;
        self.repo.save_execution(&record).await?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut path: Vec<String> = Vec::new();
        let mut current = dag.initial_stage.clone();

        loop {
            if !visited.insert(current.clone()) {
                path.push(current.clone());
                let err = CaseflowError::circular(current, path.join(" -> "));
                return self.fail(record, err).await;
            }
            path.push(current.clone());

            record.current_stage = current.clone();
            self.repo.save_execution(&record).await?;

            // validate() guarantees this, but a stale reference must not panic
            let Some(stage) = dag.stage(&current) else {
                let err = CaseflowError::unknown_stage(current);
                return self.fail(record, err).await;
            };

            match self.run_stage(stage, &record, session_id).await {
                Ok(output) => {
                    merge_context(&mut record.context, stage, output.data);
                    self.repo.save_execution(&record).await?;
                    info!(stage = %stage.id, "stage completed");
                }
                Err(err) => return self.fail(record, err).await,
            }

            match &stage.next {
                Some(next) => current = next.clone(),
                None => {
                    record.status = WorkflowStatus::Completed;
                    self.repo.save_execution(&record).await?;
                    self.breaker.forget_execution(&record.execution_id);
                    info!(execution_id = %record.execution_id, stages = path.len(), "workflow completed");
                    return Ok(record);
                }
            }
        }
    }

    async fn run_stage(
        &self,
        stage: &WorkflowStage,
        record: &ExecutionRecord,
        session_id: &str,
    ) -> Result<StepOutput> {
        let step = self.registry.get(&stage.step)?;
        let policy = stage
            .retry
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());
        let retry = RetryExecutor::new(policy)?;

        let execution_id = record.execution_id.clone();
        let stage_id = stage.id.clone();
        let timeout = stage.timeout();
        let input = StepInput::new(Value::Object(serde_json::Map::new()), record.context.clone());

        retry
            .execute(&stage.id, |_attempt| {
                let step = step.clone();
                let input = input.clone();
                let execution_id = execution_id.clone();
                let stage_id = stage_id.clone();
                async move {
                    self.breaker.check(&execution_id, &stage_id)?;
                    let attempt =
                        match tokio::time::timeout(timeout, step.execute(session_id, &input)).await
                        {
                            Ok(inner) => inner,
                            Err(_) => Err(CaseflowError::timeout(
                                stage_id.clone(),
                                timeout.as_millis() as u64,
                            )),
                        };
                    match attempt {
                        Ok(output) => {
                            self.breaker.record_success(&execution_id, &stage_id);
                            Ok(output)
                        }
                        Err(err) => {
                            self.breaker.record_failure(&execution_id, &stage_id);
                            Err(err)
                        }
                    }
                }
            })
            .await
    }

    async fn fail(
        &self,
        mut record: ExecutionRecord,
        err: CaseflowError,
    ) -> Result<ExecutionRecord> {
        warn!(execution_id = %record.execution_id, stage = %record.current_stage, error = %err, "workflow failed");
        record.status = WorkflowStatus::Failed;
        record.error = Some(err.to_string());
        self.repo.save_execution(&record).await?;
        self.breaker.forget_execution(&record.execution_id);
        Err(err)
    }
}

/// Object outputs merge key by key into the running context; anything else
/// lands under the stage id.
fn merge_context(context: &mut Value, stage: &WorkflowStage, output: Value) {
    if !context.is_object() {
        *context = Value::Object(serde_json::Map::new());
    }
    let Some(map) = context.as_object_mut() else {
        return;
    };
    match output {
        Value::Object(entries) => {
            for (key, value) in entries {
                map.insert(key, value);
            }
        }
        other => {
            map.insert(stage.id.clone(), other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SledStateStore;
    use crate::step::GenerationStep;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct EchoStep {
        name: &'static str,
        payload: Value,
    }

    #[async_trait]
    impl GenerationStep for EchoStep {
        fn name(&self) -> &str {
            self.name
        }

        fn output_key(&self) -> &str {
            self.name
        }

        async fn execute(&self, _session_id: &str, _input: &StepInput) -> Result<StepOutput> {
            Ok(StepOutput {
                data: self.payload.clone(),
                tokens_used: 1,
                latency_ms: 1,
            })
        }
    }

    struct FlakyStep {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GenerationStep for FlakyStep {
        fn name(&self) -> &str {
            "flaky"
        }

        fn output_key(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _session_id: &str, _input: &StepInput) -> Result<StepOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures_before_success {
                Err(CaseflowError::step_execution("flaky", "transient outage"))
            } else {
                Ok(StepOutput {
                    data: json!({"recovered": true}),
                    tokens_used: 1,
                    latency_ms: 1,
                })
            }
        }
    }

    struct SlowStep;

    #[async_trait]
    impl GenerationStep for SlowStep {
        fn name(&self) -> &str {
            "slow"
        }

        fn output_key(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _session_id: &str, _input: &StepInput) -> Result<StepOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StepOutput {
                data: json!({}),
                tokens_used: 0,
                latency_ms: 0,
            })
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            jitter: false,
            max_elapsed: None,
        }
    }

    fn open_repo() -> (Arc<dyn StateRepository>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SledStateStore::open(dir.path().join("state.db")).unwrap();
        (Arc::new(store), dir)
    }

    fn linear_dag() -> WorkflowDag {
        WorkflowDag::from_yaml(
            r#"
name: value_case
initial_stage: profile
stages:
  - id: profile
    step: profile
    next: value_map
  - id: value_map
    step: value_map
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_linear_graph_completes_and_merges_context() {
        let (repo, _dir) = open_repo();
        let registry = Arc::new(StepRegistry::new());
        registry
            .register(Arc::new(EchoStep {
                name: "profile",
                payload: json!({"profile": {"industry": "logistics"}}),
            }))
            .unwrap();
        registry
            .register(Arc::new(EchoStep {
                name: "value_map",
                payload: json!({"value_map": {"kpis": ["time saved"]}}),
            }))
            .unwrap();

        let executor = WorkflowExecutor::new(registry, repo.clone());
        let record = executor
            .execute(&linear_dag(), "sess_1", json!({"seed": 1}))
            .await
            .unwrap();

        assert_eq!(record.status, WorkflowStatus::Completed);
        assert_eq!(record.context["seed"], 1);
        assert_eq!(record.context["profile"]["industry"], "logistics");
        assert_eq!(record.context["value_map"]["kpis"][0], "time saved");

        let persisted = repo
            .get_execution(&record.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_cyclic_graph_fails_instead_of_looping() {
        let (repo, _dir) = open_repo();
        let registry = Arc::new(StepRegistry::new());
        registry
            .register(Arc::new(EchoStep {
                name: "noop",
                payload: json!({}),
            }))
            .unwrap();

        // Two stages pointing back at each other
        let dag = WorkflowDag::from_yaml(
            r#"
name: looped
initial_stage: a
stages:
  - id: a
    step: noop
    next: b
  - id: b
    step: noop
    next: a
"#,
        )
        .unwrap();

        let executor = WorkflowExecutor::new(registry, repo.clone());
        let err = executor
            .execute(&dag, "sess_1", json!({}))
            .await
            .unwrap_err();
        match err {
            CaseflowError::CircularDependency { stage, path } => {
                assert_eq!(stage, "a");
                assert_eq!(path, "a -> b -> a");
            }
            other => panic!("expected circular dependency, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_transient_stage_failure_is_retried() {
        let (repo, _dir) = open_repo();
        let registry = Arc::new(StepRegistry::new());
        registry
            .register(Arc::new(FlakyStep {
                failures_before_success: 2,
                calls: AtomicU32::new(0),
            }))
            .unwrap();

        let dag = WorkflowDag::from_yaml(
            r#"
name: flaky_flow
initial_stage: only
stages:
  - id: only
    step: flaky
"#,
        )
        .unwrap();

        let executor = WorkflowExecutor::new(registry, repo)
            .with_default_retry(fast_retry(3))
            .with_breaker(Arc::new(CircuitBreaker::new(10, Duration::from_secs(60))));
        let record = executor.execute(&dag, "sess_1", json!({})).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
        assert_eq!(record.context["recovered"], true);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_execution_failed() {
        let (repo, _dir) = open_repo();
        let registry = Arc::new(StepRegistry::new());
        registry
            .register(Arc::new(FlakyStep {
                failures_before_success: u32::MAX,
                calls: AtomicU32::new(0),
            }))
            .unwrap();

        let dag = WorkflowDag::from_yaml(
            r#"
name: doomed
initial_stage: only
stages:
  - id: only
    step: flaky
"#,
        )
        .unwrap();

        let executor = WorkflowExecutor::new(registry, repo.clone())
            .with_default_retry(fast_retry(2))
            .with_breaker(Arc::new(CircuitBreaker::new(10, Duration::from_secs(60))));
        let err = executor
            .execute(&dag, "sess_1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CaseflowError::StepExecution { .. }));
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_further_attempts() {
        let (repo, _dir) = open_repo();
        let registry = Arc::new(StepRegistry::new());
        registry
            .register(Arc::new(FlakyStep {
                failures_before_success: u32::MAX,
                calls: AtomicU32::new(0),
            }))
            .unwrap();

        let dag = WorkflowDag::from_yaml(
            r#"
name: tripped
initial_stage: only
stages:
  - id: only
    step: flaky
"#,
        )
        .unwrap();

        // Breaker opens after the first failure; the second attempt is
        // rejected without reaching the step
        let executor = WorkflowExecutor::new(registry, repo)
            .with_default_retry(fast_retry(5))
            .with_breaker(Arc::new(CircuitBreaker::new(1, Duration::from_secs(60))));
        let err = executor
            .execute(&dag, "sess_1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CaseflowError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_finished_executions_leave_no_breaker_state() {
        let (repo, _dir) = open_repo();
        let registry = Arc::new(StepRegistry::new());
        registry
            .register(Arc::new(FlakyStep {
                failures_before_success: 1,
                calls: AtomicU32::new(0),
            }))
            .unwrap();

        let dag = WorkflowDag::from_yaml(
            r#"
name: flaky_flow
initial_stage: only
stages:
  - id: only
    step: flaky
"#,
        )
        .unwrap();

        let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(60)));
        let executor = WorkflowExecutor::new(registry, repo)
            .with_default_retry(fast_retry(3))
            .with_breaker(breaker.clone());

        // First run retries once (leaving a failure entry mid-flight), the
        // rest succeed outright; none may be retained after finishing
        for n in 0..100 {
            let session = format!("sess_{n}");
            executor.execute(&dag, &session, json!({})).await.unwrap();
        }
        assert_eq!(breaker.tracked_stages(), 0);
    }

    #[tokio::test]
    async fn test_failed_execution_leaves_no_breaker_state() {
        let (repo, _dir) = open_repo();
        let registry = Arc::new(StepRegistry::new());
        registry
            .register(Arc::new(FlakyStep {
                failures_before_success: u32::MAX,
                calls: AtomicU32::new(0),
            }))
            .unwrap();

        let dag = WorkflowDag::from_yaml(
            r#"
name: doomed
initial_stage: only
stages:
  - id: only
    step: flaky
"#,
        )
        .unwrap();

        let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(60)));
        let executor = WorkflowExecutor::new(registry, repo)
            .with_default_retry(fast_retry(2))
            .with_breaker(breaker.clone());

        executor.execute(&dag, "sess_1", json!({})).await.unwrap_err();
        assert_eq!(breaker.tracked_stages(), 0);
    }

    #[tokio::test]
    async fn test_stage_timeout_is_enforced() {
        let (repo, _dir) = open_repo();
        let registry = Arc::new(StepRegistry::new());
        registry.register(Arc::new(SlowStep)).unwrap();

        let dag = WorkflowDag::from_yaml(
            r#"
name: slow_flow
initial_stage: only
stages:
  - id: only
    step: slow
    timeout_secs: 1
"#,
        )
        .unwrap();

        let executor = WorkflowExecutor::new(registry, repo)
            .with_default_retry(fast_retry(1))
            .with_breaker(Arc::new(CircuitBreaker::new(10, Duration::from_secs(60))));

        let started = std::time::Instant::now();
        let err = executor
            .execute(&dag, "sess_1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CaseflowError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
