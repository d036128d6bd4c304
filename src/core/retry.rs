use crate::core::errors::{CaseflowError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry behavior for one execution. Immutable once handed to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Backoff multiplier applied per attempt
    pub multiplier: f64,
    /// Randomize delays to avoid thundering herds
    pub jitter: bool,
    /// Optional budget on total elapsed time across attempts
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            max_elapsed: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CaseflowError::configuration_field(
                "max_attempts must be greater than 0",
                "max_attempts",
            ));
        }
        if self.multiplier < 1.0 {
            return Err(CaseflowError::configuration_field(
                "multiplier must be at least 1.0",
                "multiplier",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(CaseflowError::configuration_field(
                "max_delay must not be less than initial_delay",
                "max_delay",
            ));
        }
        Ok(())
    }

    /// Conservative preset for compensating/rollback operations: fewer, more
    /// patient retries.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 3.0,
            jitter: false,
            max_elapsed: Some(Duration::from_secs(300)),
        }
    }

    /// Delay preceding the given retry attempt (attempt numbering starts at 1;
    /// the first retry is attempt 2). The mean is `min(initial * multiplier^
    /// (attempt-1), max)`; jitter perturbs by up to ±50% and never goes
    /// negative.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64).max(0.0);

        let final_ms = if self.jitter && capped_ms > 0.0 {
            let factor = 0.5 + fastrand::f64(); // 0.5..1.5
            (capped_ms * factor).min(self.max_delay.as_millis() as f64)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms.max(0.0) as u64)
    }
}

/// Pluggable sink for retry telemetry. Defaults to a no-op.
pub trait RetryMetricsSink: Send + Sync {
    fn on_attempt(&self, operation: &str, attempt: u32);
    fn on_retry(&self, operation: &str, attempt: u32, delay: Duration);
    fn on_outcome(&self, operation: &str, attempts: u32, success: bool, elapsed: Duration);
}

/// Pluggable logger for retry events. Defaults to tracing output.
pub trait RetryLogger: Send + Sync {
    fn attempt_failed(&self, operation: &str, attempt: u32, error: &CaseflowError);
    fn gave_up(&self, operation: &str, attempts: u32, error: &CaseflowError);
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl RetryMetricsSink for NoopMetrics {
    fn on_attempt(&self, _operation: &str, _attempt: u32) {}
    fn on_retry(&self, _operation: &str, _attempt: u32, _delay: Duration) {}
    fn on_outcome(&self, _operation: &str, _attempts: u32, _success: bool, _elapsed: Duration) {}
}

#[derive(Debug, Default)]
pub struct TracingRetryLogger;

impl RetryLogger for TracingRetryLogger {
    fn attempt_failed(&self, operation: &str, attempt: u32, error: &CaseflowError) {
        warn!(operation, attempt, error = %error, "attempt failed");
    }

    fn gave_up(&self, operation: &str, attempts: u32, error: &CaseflowError) {
        warn!(operation, attempts, error = %error, "retries exhausted");
    }
}

/// Generic retry-with-backoff wrapper used by every external call
pub struct RetryExecutor {
    policy: RetryPolicy,
    metrics: Arc<dyn RetryMetricsSink>,
    logger: Arc<dyn RetryLogger>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            metrics: Arc::new(NoopMetrics),
            logger: Arc::new(TracingRetryLogger),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn RetryMetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn RetryLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the operation, retrying retryable failures while attempts and the
    /// elapsed-time budget remain. Exhaustion surfaces the last error.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.metrics.on_attempt(operation, attempt);

            match f(attempt).await {
                Ok(value) => {
                    self.metrics
                        .on_outcome(operation, attempt, true, started.elapsed());
                    return Ok(value);
                }
                Err(err) => {
                    self.logger.attempt_failed(operation, attempt, &err);

                    if !err.is_retryable() || attempt >= self.policy.max_attempts {
                        self.logger.gave_up(operation, attempt, &err);
                        self.metrics
                            .on_outcome(operation, attempt, false, started.elapsed());
                        return Err(err);
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    if let Some(budget) = self.policy.max_elapsed {
                        if started.elapsed() + delay > budget {
                            self.logger.gave_up(operation, attempt, &err);
                            self.metrics
                                .on_outcome(operation, attempt, false, started.elapsed());
                            return Err(err);
                        }
                    }

                    debug!(operation, attempt, ?delay, "backing off before retry");
                    self.metrics.on_retry(operation, attempt, delay);
                    sleep(delay).await;
                }
            }
        }
    }
}
