//! Error types for Litmus operations
//!
//! The engine distinguishes four severities:
//! - [`TemplateError`]: fatal, the run is aborted before any unit executes
//! - [`UnitError`]: isolated to one test case result, which is marked errored
//! - [`EvaluationError`]: isolated to one evaluation strategy of a unit
//! - [`crate::model::ResolutionWarning`]: non-fatal, attached to the result

use std::time::Duration;

use crate::store::StoreError;

/// Result type for Litmus operations
pub type Result<T> = std::result::Result<T, LitmusError>;

/// Top-level error type for the engine
#[derive(Debug, thiserror::Error)]
pub enum LitmusError {
    /// Template could not be used for a run
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Run/result store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// LLM provider failure (transient, retryable)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for LitmusError {
    fn from(s: String) -> Self {
        LitmusError::Other(s)
    }
}

impl From<&str> for LitmusError {
    fn from(s: &str) -> Self {
        LitmusError::Other(s.to_string())
    }
}

/// Malformed or missing template. Aborts the run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    #[error("Template '{0}' not found")]
    NotFound(String),

    #[error("Template '{id}' is malformed: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Mission template '{0}' has no usable mission_duration")]
    MissingMissionDuration(String),

    #[error("Run '{run_id}' references template '{expected}', not '{actual}'")]
    Mismatch {
        run_id: String,
        expected: String,
        actual: String,
    },
}

/// Failure of a single unit's pipeline. Captured into an `Errored` result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UnitError {
    /// Expanded payload is not a usable request description
    #[error("Invalid request payload: {0}")]
    InvalidPayload(String),

    /// Network-level failure talking to the target endpoint
    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// Target endpoint answered with a non-2xx status
    #[error("Target endpoint returned HTTP {status}")]
    Status { status: u16, body: String },

    /// Target call exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Completion provider failed while driving a mission
    #[error("Provider failed on turn {turn}: {message}")]
    Provider { turn: usize, message: String },

    /// Completion provider returned no usable next request
    #[error("Invalid mission action on turn {turn}: {reason}")]
    InvalidAction { turn: usize, reason: String },

    /// Unit task panicked or was aborted
    #[error("Unit execution aborted: {0}")]
    Aborted(String),
}

/// Failure of one evaluation strategy. Isolated to that strategy's result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluationError {
    #[error("Evaluation provider error: {0}")]
    Provider(String),

    #[error("Could not parse evaluator output: {0}")]
    Parse(String),

    #[error("Evaluation input missing: {0}")]
    MissingInput(String),
}

impl From<LitmusError> for EvaluationError {
    fn from(err: LitmusError) -> Self {
        EvaluationError::Provider(err.to_string())
    }
}
