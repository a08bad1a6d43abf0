//! Error types for artifact integrity

use std::path::PathBuf;
use thiserror::Error;

/// Result type for artifact operations
pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Artifact and manifest errors
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// File does not exist
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    /// File could not be read or written
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest could not be serialized or parsed
    #[error("Invalid manifest {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Refusing to replace an existing manifest
    #[error("Manifest already exists: {0}")]
    ManifestExists(PathBuf),

    /// Live file size differs from the recorded one
    #[error("Size mismatch for {path}: recorded {expected} bytes, found {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Live file content differs from the recorded checksum
    #[error("Checksum mismatch for {path}: recorded {expected}, found {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl ArtifactError {
    /// Wrap an IO error, mapping "not found" to [`ArtifactError::NotFound`]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { path, source }
        }
    }
}
