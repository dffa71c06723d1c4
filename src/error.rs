//! Error types for tokenlane
//!
//! Centralized error handling using thiserror. Per-request failures are not
//! errors at this level: they travel as [`crate::llm::ClassifiedError`] inside
//! a settled task result.

use thiserror::Error;

/// All error types that can occur in tokenlane
#[derive(Debug, Error)]
pub enum TokenlaneError {
    /// A task id was reported back that the manager is not tracking.
    /// The queue bookkeeping is corrupt.
    #[error("Scheduling invariant violated: {0}")]
    SchedulingInvariant(String),

    /// Task rejected at submission
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// No configured worker could ever admit the task
    #[error("Task cannot be scheduled: {0}")]
    Unschedulable(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// HTTP client construction error
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for tokenlane operations
pub type Result<T> = std::result::Result<T, TokenlaneError>;
