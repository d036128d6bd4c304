//! Circuit breaker keyed by (execution id, stage id). Opens after a run of
//! consecutive failures and rejects calls until the cooldown elapses; the
//! first call after cooldown probes the stage again.

use crate::core::errors::{CaseflowError, Result};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone)]
struct BreakerEntry {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn closed() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    entries: DashMap<(String, String), BreakerEntry>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn key(execution_id: &str, stage_id: &str) -> (String, String) {
        (execution_id.to_string(), stage_id.to_string())
    }

    /// Fails with `CircuitOpen` while the breaker is open and cooling down.
    /// After the cooldown the call is allowed through as a probe.
    pub fn check(&self, execution_id: &str, stage_id: &str) -> Result<()> {
        let key = Self::key(execution_id, stage_id);
        if let Some(entry) = self.entries.get(&key) {
            if let Some(opened_at) = entry.opened_at {
                if opened_at.elapsed() < self.cooldown {
                    return Err(CaseflowError::CircuitOpen {
                        execution_id: execution_id.to_string(),
                        stage: stage_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// A closed breaker has no entry at all, so success removes the key and
    /// the table only holds stages with an active failure run.
    pub fn record_success(&self, execution_id: &str, stage_id: &str) {
        self.entries.remove(&Self::key(execution_id, stage_id));
    }

    pub fn record_failure(&self, execution_id: &str, stage_id: &str) {
        let mut entry = self
            .entries
            .entry(Self::key(execution_id, stage_id))
            .or_insert_with(BreakerEntry::closed);
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.failure_threshold && entry.opened_at.is_none() {
            warn!(
                execution_id,
                stage_id,
                failures = entry.consecutive_failures,
                "circuit opened"
            );
            entry.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self, execution_id: &str, stage_id: &str) -> bool {
        self.check(execution_id, stage_id).is_err()
    }

    /// Drop every entry belonging to a finished execution. Execution ids are
    /// unique, so without this the table would grow for the life of the
    /// process.
    pub fn forget_execution(&self, execution_id: &str) {
        self.entries.retain(|(id, _), _| id != execution_id);
    }

    pub fn tracked_stages(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        assert!(breaker.check("exec_1", "profile").is_ok());

        breaker.record_failure("exec_1", "profile");
        assert!(breaker.check("exec_1", "profile").is_ok());

        breaker.record_failure("exec_1", "profile");
        let err = breaker.check("exec_1", "profile").unwrap_err();
        assert!(matches!(err, CaseflowError::CircuitOpen { .. }));
    }

    #[test]
    fn test_success_resets_failure_run() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure("exec_1", "profile");
        breaker.record_success("exec_1", "profile");
        breaker.record_failure("exec_1", "profile");
        assert!(breaker.check("exec_1", "profile").is_ok());
    }

    #[test]
    fn test_keys_are_scoped_per_execution_and_stage() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("exec_1", "profile");

        assert!(breaker.is_open("exec_1", "profile"));
        assert!(!breaker.is_open("exec_1", "value_map"));
        assert!(!breaker.is_open("exec_2", "profile"));
    }

    #[test]
    fn test_success_leaves_no_entry_behind() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for n in 0..1000 {
            let execution_id = format!("exec_{n}");
            breaker.record_failure(&execution_id, "only");
            breaker.record_success(&execution_id, "only");
        }
        assert_eq!(breaker.tracked_stages(), 0);
    }

    #[test]
    fn test_forget_execution_drops_its_stages_only() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("exec_1", "profile");
        breaker.record_failure("exec_1", "value_map");
        breaker.record_failure("exec_2", "profile");

        breaker.forget_execution("exec_1");
        assert_eq!(breaker.tracked_stages(), 1);
        assert!(!breaker.is_open("exec_1", "profile"));
        assert!(breaker.is_open("exec_2", "profile"));
    }

    #[test]
    fn test_probe_allowed_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure("exec_1", "profile");
        // Zero cooldown: the very next check is a probe
        assert!(breaker.check("exec_1", "profile").is_ok());
    }
}
