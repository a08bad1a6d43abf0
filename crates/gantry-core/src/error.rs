//! Error types for Gantry core

use std::path::PathBuf;
use thiserror::Error;

/// Result type for loading and validating configuration
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors from reading a configuration
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The configuration file exists but could not be read
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A configuration that is missing, malformed or inconsistent
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration file in the directory or its parents
    #[error("No gantry configuration found in {0} or its parents")]
    NotFound(PathBuf),

    /// A value breaks a rule; `field` is the dotted config path
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}
