use crate::core::errors::{CaseflowError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Hard caps on a single execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum wall-clock time for one attempt
    pub max_duration: Duration,
    /// Maximum number of completion-service calls
    pub max_llm_calls: u64,
    /// Maximum nested-call depth
    pub max_recursion_depth: u64,
    /// Maximum process memory in bytes
    pub max_memory_bytes: u64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(300), // 5 minutes
            max_llm_calls: 50,
            max_recursion_depth: 10,
            max_memory_bytes: 1_000_000_000, // 1GB
        }
    }
}

impl SafetyLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_duration.is_zero() {
            return Err(CaseflowError::configuration_field(
                "max_duration must be greater than 0",
                "max_duration",
            ));
        }
        if self.max_llm_calls == 0 {
            return Err(CaseflowError::configuration_field(
                "max_llm_calls must be greater than 0",
                "max_llm_calls",
            ));
        }
        if self.max_recursion_depth == 0 {
            return Err(CaseflowError::configuration_field(
                "max_recursion_depth must be greater than 0",
                "max_recursion_depth",
            ));
        }
        if self.max_memory_bytes == 0 {
            return Err(CaseflowError::configuration_field(
                "max_memory_bytes must be greater than 0",
                "max_memory_bytes",
            ));
        }
        Ok(())
    }

    /// Create conservative limits for testing
    pub fn conservative() -> Self {
        Self {
            max_duration: Duration::from_secs(30),
            max_llm_calls: 10,
            max_recursion_depth: 5,
            max_memory_bytes: 100_000_000, // 100MB
        }
    }
}

/// One recorded limit breach
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitViolation {
    pub limit: String,
    pub observed: u64,
    pub threshold: u64,
}

/// Cooperative cancellation signal threaded through in-flight calls.
/// Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Process memory sampler, injectable so tests can exercise the ceiling
/// deterministically.
pub type MemorySampler = Box<dyn Fn() -> u64 + Send + Sync>;

/// Reads resident set size from /proc/self/statm. Returns 0 where the file is
/// unavailable, making the memory ceiling advisory off-Linux.
fn default_memory_sampler() -> u64 {
    match std::fs::read_to_string("/proc/self/statm") {
        Ok(contents) => contents
            .split_whitespace()
            .nth(1)
            .and_then(|pages| pages.parse::<u64>().ok())
            .map(|pages| pages * 4096)
            .unwrap_or(0),
        Err(_) => 0,
    }
}

/// Per-attempt safety tracker. Scoped to exactly one generation loop
/// invocation; never shared across attempts.
pub struct SafetyGuard {
    limits: SafetyLimits,
    started_at: Mutex<Option<Instant>>,
    llm_calls: AtomicU64,
    recursion_depth: AtomicU64,
    peak_recursion_depth: AtomicU64,
    peak_memory_bytes: AtomicU64,
    violations: Mutex<Vec<LimitViolation>>,
    cancel: CancelSignal,
    deadline_handle: Mutex<Option<JoinHandle<()>>>,
    memory_sampler: MemorySampler,
}

impl std::fmt::Debug for SafetyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGuard")
            .field("limits", &self.limits)
            .field("llm_calls", &self.llm_calls)
            .field("recursion_depth", &self.recursion_depth)
            .finish_non_exhaustive()
    }
}

impl SafetyGuard {
    pub fn new(limits: SafetyLimits) -> Result<Self> {
        limits.validate()?;
        Ok(Self {
            limits,
            started_at: Mutex::new(None),
            llm_calls: AtomicU64::new(0),
            recursion_depth: AtomicU64::new(0),
            peak_recursion_depth: AtomicU64::new(0),
            peak_memory_bytes: AtomicU64::new(0),
            violations: Mutex::new(Vec::new()),
            cancel: CancelSignal::new(),
            deadline_handle: Mutex::new(None),
            memory_sampler: Box::new(default_memory_sampler),
        })
    }

    /// Replace the process memory sampler (tests)
    pub fn with_memory_sampler(mut self, sampler: MemorySampler) -> Self {
        self.memory_sampler = sampler;
        self
    }

    /// Record the attempt start time and arm the hard wall-clock deadline.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut started = self.started_at.lock().expect("started_at poisoned");
        if started.is_some() {
            return;
        }
        *started = Some(Instant::now());

        let cancel = self.cancel.clone();
        let max_duration = self.limits.max_duration;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(max_duration).await;
            warn!(?max_duration, "attempt deadline reached, signalling abort");
            cancel.cancel();
        });
        *self.deadline_handle.lock().expect("deadline poisoned") = Some(handle);
        debug!("safety guard armed");
    }

    fn elapsed(&self) -> Duration {
        self.started_at
            .lock()
            .expect("started_at poisoned")
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    fn record_violation(&self, limit: &str, observed: u64, threshold: u64) -> CaseflowError {
        let violation = LimitViolation {
            limit: limit.to_string(),
            observed,
            threshold,
        };
        self.violations
            .lock()
            .expect("violations poisoned")
            .push(violation);
        CaseflowError::safety_violation(limit, observed, threshold)
    }

    /// Cancellation signal consulted by long-running calls before each unit
    /// of work.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// True once the deadline has fired or the elapsed time exceeds the cap
    pub fn should_abort(&self) -> bool {
        self.cancel.is_cancelled() || self.elapsed() > self.limits.max_duration
    }

    /// Checkpoint consulted before each unit of work. Raises the single
    /// Safety Violation kind once the wall-clock budget is exhausted.
    pub fn check_deadline(&self) -> Result<()> {
        if self.should_abort() {
            let observed = self.elapsed().as_millis() as u64;
            return Err(self.record_violation(
                "max_duration",
                observed.max(self.limits.max_duration.as_millis() as u64),
                self.limits.max_duration.as_millis() as u64,
            ));
        }
        Ok(())
    }

    /// Increment the external-call counter. Equal to the limit is allowed;
    /// one more is a violation.
    pub fn record_call(&self) -> Result<()> {
        let observed = self.llm_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if observed > self.limits.max_llm_calls {
            return Err(self.record_violation("max_llm_calls", observed, self.limits.max_llm_calls));
        }
        debug!(llm_calls = observed, "recorded completion call");
        Ok(())
    }

    /// Enter a nested call. The returned guard decrements depth on every exit
    /// path, including failure.
    pub fn enter_recursion(&self) -> Result<RecursionGuard<'_>> {
        let depth = self.recursion_depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > self.limits.max_recursion_depth {
            self.recursion_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(self.record_violation(
                "max_recursion_depth",
                depth,
                self.limits.max_recursion_depth,
            ));
        }
        let peak = self.peak_recursion_depth.load(Ordering::Relaxed);
        if depth > peak {
            self.peak_recursion_depth.store(depth, Ordering::Relaxed);
        }
        Ok(RecursionGuard { guard: self })
    }

    /// Current nested-call depth
    pub fn recursion_depth(&self) -> u64 {
        self.recursion_depth.load(Ordering::SeqCst)
    }

    /// Sample process memory and abort above the configured ceiling
    pub fn check_memory_usage(&self) -> Result<()> {
        let observed = (self.memory_sampler)();
        let peak = self.peak_memory_bytes.load(Ordering::Relaxed);
        if observed > peak {
            self.peak_memory_bytes.store(observed, Ordering::Relaxed);
        }
        if observed > self.limits.max_memory_bytes {
            return Err(self.record_violation(
                "max_memory_bytes",
                observed,
                self.limits.max_memory_bytes,
            ));
        }
        Ok(())
    }

    /// Finalize the attempt: cancel the armed deadline and return an
    /// immutable metrics snapshot.
    pub fn complete(&self) -> SafetyMetrics {
        if let Some(handle) = self.deadline_handle.lock().expect("deadline poisoned").take() {
            handle.abort();
        }
        SafetyMetrics {
            elapsed: self.elapsed(),
            llm_calls: self.llm_calls.load(Ordering::SeqCst),
            peak_recursion_depth: self.peak_recursion_depth.load(Ordering::SeqCst),
            peak_memory_bytes: self.peak_memory_bytes.load(Ordering::SeqCst),
            violations: self.violations.lock().expect("violations poisoned").clone(),
        }
    }
}

impl Drop for SafetyGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.deadline_handle.lock().expect("deadline poisoned").take() {
            handle.abort();
        }
    }
}

/// RAII nested-call depth tracker
#[derive(Debug)]
pub struct RecursionGuard<'a> {
    guard: &'a SafetyGuard,
}

impl Drop for RecursionGuard<'_> {
    fn drop(&mut self) {
        self.guard.recursion_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Immutable snapshot of one attempt's resource accounting
#[derive(Debug, Clone)]
pub struct SafetyMetrics {
    pub elapsed: Duration,
    pub llm_calls: u64,
    pub peak_recursion_depth: u64,
    pub peak_memory_bytes: u64,
    pub violations: Vec<LimitViolation>,
}
