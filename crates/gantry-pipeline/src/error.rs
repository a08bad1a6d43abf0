//! Error types for pipeline runs

use gantry_artifacts::ArtifactError;
use gantry_core::{ConfigError, CoreError, StageKind};
use gantry_signing::SigningError;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline errors. Every variant names the stage it happened in, if any.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid pipeline configuration
    #[error(transparent)]
    Config(#[from] CoreError),

    /// A placeholder could not be expanded
    #[error("Stage '{stage}': {message}")]
    Template { stage: String, message: String },

    /// The stage command ran out of attempts
    #[error(
        "Stage '{stage}' ({kind}) failed after {attempts} attempt(s), exit code {exit_code}: {reason}"
    )]
    StageFailed {
        stage: String,
        kind: StageKind,
        attempts: u32,
        exit_code: i32,
        reason: String,
    },

    /// The stage's signing identity could not be resolved
    #[error("Stage '{stage}': {source}")]
    Identity {
        stage: String,
        #[source]
        source: SigningError,
    },

    /// The signing session could not be set up or torn down
    #[error("Signing session: {0}")]
    Session(#[source] SigningError),

    /// A produced artifact could not be recorded
    #[error("Stage '{stage}': {source}")]
    Artifact {
        stage: String,
        #[source]
        source: ArtifactError,
    },

    /// The manifest could not be created
    #[error("Manifest: {0}")]
    Manifest(#[source] ArtifactError),

    /// Background task failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.into())
    }
}

impl PipelineError {
    /// Get exit code for CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StageFailed { kind, .. } => match kind {
                StageKind::Sign => 2,
                StageKind::Notarize | StageKind::Staple => 3,
                StageKind::Build | StageKind::Package | StageKind::Publish | StageKind::Custom => 1,
            },
            Self::Identity { .. } => 2,
            Self::Config(_) | Self::Template { .. } => 4,
            Self::Artifact { .. } | Self::Manifest(_) => 5,
            Self::Session(_) => 6,
            Self::Internal(_) => 1,
        }
    }

    /// Stage the failure happened in
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Template { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::Identity { stage, .. }
            | Self::Artifact { stage, .. } => Some(stage),
            _ => None,
        }
    }
}
