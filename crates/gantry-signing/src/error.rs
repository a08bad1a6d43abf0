//! Error types for signing operations

use thiserror::Error;

use gantry_core::Classification;

/// Result type alias for signing operations
pub type Result<T> = std::result::Result<T, SigningError>;

/// Signing-related errors
#[derive(Debug, Error)]
pub enum SigningError {
    /// Every cascade step came up empty
    #[error(
        "No {classification} identity found. Store reported [{}]. Cascade: {}",
        .labels.join(", "),
        .steps.join("; ")
    )]
    NoIdentitiesFound {
        classification: Classification,
        /// Labels in store order
        labels: Vec<String>,
        /// Outcome of each cascade step, in order
        steps: Vec<String>,
    },

    /// Several identities match and nothing narrows the choice
    #[error(
        "{count} identities match {classification} and no label constraint was given: [{}]",
        .labels.join(", ")
    )]
    AmbiguousWithoutConstraint {
        classification: Classification,
        count: usize,
        labels: Vec<String>,
    },

    /// A certificate bundle could not be decoded or imported
    #[error("Failed to import certificate bundle {bundle}: {reason}")]
    ImportFailed { bundle: String, reason: String },

    /// The ephemeral store could not be created
    #[error("Failed to create identity store {store}: {reason}")]
    StoreCreationFailed { store: String, reason: String },

    /// Another session still holds a store
    #[error("Signing session already active for store {store}")]
    SessionAlreadyActive { store: String },

    /// Keychain error
    #[error("Keychain error: {0}")]
    KeychainError(String),

    /// Tool not found
    #[error("Signing tool not found: {tool}. {hint}")]
    ToolNotFound { tool: String, hint: String },

    /// Tool execution failed
    #[error("Signing tool failed: {tool} - {reason}")]
    ToolFailed { tool: String, reason: String },

    /// Configuration error
    #[error("Signing configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
