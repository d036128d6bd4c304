use thiserror::Error;

/// Unified error type for the entire caseflow engine
#[derive(Debug, Error)]
pub enum CaseflowError {
    /// A hard execution limit was breached. Fatal to the current attempt;
    /// never retried by the limiter itself.
    #[error("Safety violation: {limit} (observed: {observed}, threshold: {threshold})")]
    SafetyViolation {
        limit: String,
        observed: u64,
        threshold: u64,
    },

    /// Completion service failures (network/availability class)
    #[error("Completion service failed: {operation} - {message}")]
    Completion {
        operation: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Persistent store failures
    #[error("Store operation failed: {operation}")]
    Store {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Optimistic-concurrency conflict on a session update
    #[error("Concurrent update conflict for session {session_id}")]
    Conflict { session_id: String },

    /// Model output (or step output) failed schema validation. Must never be
    /// coerced into a valid-looking value.
    #[error("Schema validation failed in {context}: {message}")]
    SchemaValidation { context: String, message: String },

    /// Structural defect in a workflow graph
    #[error("Circular dependency detected at stage '{stage}' (path: {path})")]
    CircularDependency { stage: String, path: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A stage name outside the configured stage set (caller contract violation)
    #[error("Unknown stage: {stage}")]
    UnknownStage { stage: String },

    /// No generation step registered under the given name
    #[error("Generation step not found: {step}")]
    StepNotFound { step: String },

    /// Step execution failures
    #[error("Step '{step}' failed: {message}")]
    StepExecution {
        step: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Cooperative cancellation
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    /// Circuit breaker rejected the call
    #[error("Circuit open for stage '{stage}' of execution {execution_id}")]
    CircuitOpen { execution_id: String, stage: String },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Network/IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CaseflowError {
    /// Create a safety violation error
    pub fn safety_violation<S: Into<String>>(limit: S, observed: u64, threshold: u64) -> Self {
        Self::SafetyViolation {
            limit: limit.into(),
            observed,
            threshold,
        }
    }

    /// Create a completion service error
    pub fn completion<S: Into<String>, M: Into<String>>(operation: S, message: M) -> Self {
        Self::Completion {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a completion service error with source
    pub fn completion_with_source<
        S: Into<String>,
        M: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    >(
        operation: S,
        message: M,
        source: E,
    ) -> Self {
        Self::Completion {
            operation: operation.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a store error
    pub fn store<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(session_id: S) -> Self {
        Self::Conflict {
            session_id: session_id.into(),
        }
    }

    /// Create a schema validation error
    pub fn schema<S: Into<String>, M: Into<String>>(context: S, message: M) -> Self {
        Self::SchemaValidation {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a circular dependency error
    pub fn circular<S: Into<String>, P: Into<String>>(stage: S, path: P) -> Self {
        Self::CircularDependency {
            stage: stage.into(),
            path: path.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an unknown stage error
    pub fn unknown_stage<S: Into<String>>(stage: S) -> Self {
        Self::UnknownStage {
            stage: stage.into(),
        }
    }

    /// Create a step-not-found error
    pub fn step_not_found<S: Into<String>>(step: S) -> Self {
        Self::StepNotFound { step: step.into() }
    }

    /// Create a step execution error
    pub fn step_execution<S: Into<String>, M: Into<String>>(step: S, message: M) -> Self {
        Self::StepExecution {
            step: step.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Whether the retry executor may recover this error locally.
    ///
    /// Safety violations, circular dependencies and schema failures are never
    /// retried automatically; they propagate to the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Completion { .. }
            | Self::Store { .. }
            | Self::Io { .. }
            | Self::Timeout { .. }
            | Self::Conflict { .. }
            | Self::StepExecution { .. } => true,
            Self::SafetyViolation { .. }
            | Self::SchemaValidation { .. }
            | Self::CircularDependency { .. }
            | Self::Configuration { .. }
            | Self::UnknownStage { .. }
            | Self::StepNotFound { .. }
            | Self::Cancelled { .. }
            | Self::CircuitOpen { .. }
            | Self::Serialization { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::SafetyViolation { .. } => "safety",
            Self::Completion { .. } => "completion",
            Self::Store { .. } => "store",
            Self::Conflict { .. } => "conflict",
            Self::SchemaValidation { .. } => "schema",
            Self::CircularDependency { .. } => "circular_dependency",
            Self::Configuration { .. } => "configuration",
            Self::UnknownStage { .. } => "unknown_stage",
            Self::StepNotFound { .. } => "step_not_found",
            Self::StepExecution { .. } => "step_execution",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }

    /// Generic, non-leaking message for user-visible surfaces. The detailed
    /// error is logged internally; the returned trace id correlates the two.
    pub fn user_message(&self) -> (String, String) {
        let trace_id = cuid2::create_id();
        tracing::error!(
            trace_id = %trace_id,
            category = self.category(),
            error = %self,
            "unrecoverable error"
        );
        (
            format!("The request could not be completed. Reference: {}", trace_id),
            trace_id,
        )
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CaseflowError>;

/// Convert from common error types
impl From<std::io::Error> for CaseflowError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            operation: "io_operation".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for CaseflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for CaseflowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for CaseflowError {
    fn from(err: sled::Error) -> Self {
        Self::store("sled_operation", err)
    }
}

impl From<anyhow::Error> for CaseflowError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CaseflowError::safety_violation("max_llm_calls", 3, 2);
        assert!(matches!(err, CaseflowError::SafetyViolation { .. }));
        assert_eq!(err.category(), "safety");
        let display = err.to_string();
        assert!(display.contains("max_llm_calls"));
        assert!(display.contains('3'));
        assert!(display.contains('2'));
    }

    #[test]
    fn test_retryability_policy() {
        assert!(CaseflowError::timeout("complete", 1000).is_retryable());
        assert!(CaseflowError::conflict("sess_1").is_retryable());
        assert!(CaseflowError::completion("complete", "503").is_retryable());

        assert!(!CaseflowError::safety_violation("max_duration", 2, 1).is_retryable());
        assert!(!CaseflowError::schema("assessment", "missing field").is_retryable());
        assert!(!CaseflowError::circular("target", "opportunity -> target").is_retryable());
        assert!(!CaseflowError::configuration("bad").is_retryable());
    }

    #[test]
    fn test_user_message_does_not_leak() {
        let err = CaseflowError::store(
            "save_state",
            std::io::Error::new(std::io::ErrorKind::Other, "disk /var/db full"),
        );
        let (msg, trace_id) = err.user_message();
        assert!(!msg.contains("disk"));
        assert!(!msg.contains("/var/db"));
        assert!(msg.contains(&trace_id));
    }
}
