//! Error types for command execution

use thiserror::Error;

/// Result type for execution operations
pub type Result<T> = std::result::Result<T, ExecError>;

/// Execution errors
#[derive(Debug, Error)]
pub enum ExecError {
    /// Retry policy values are out of range
    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),

    /// Command specification is unusable
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Every attempt failed
    #[error(
        "'{command}' failed after {attempts} attempt(s) in {elapsed_ms}ms: {reason}"
    )]
    ExecutionFailed {
        command: String,
        attempts: u32,
        exit_code: i32,
        elapsed_ms: u64,
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
