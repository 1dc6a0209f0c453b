//! Error types for the execution pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the execution pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request, disallowed path, file too large, unknown
    /// language, missing entry file
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Per-socket rate window exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Inbound execution queue saturated
    #[error("Execution queue full: {0}")]
    QueueFull(String),

    /// Queue wait, exec, or acquisition exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Container engine refused or timed out on an operation
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Every configured subnet pool reports full capacity
    #[error("Subnet pools exhausted: {0}")]
    SubnetExhausted(String),

    /// Engine reports "already exists" for a name or subnet
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    /// Background cleanup failure; recorded in metrics, never propagated
    /// to a request path
    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),

    /// Unexpected condition
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
