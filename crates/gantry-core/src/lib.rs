//! Gantry Core - shared types, errors and configuration
//!
//! This crate holds the pieces every other Gantry crate agrees on: the
//! classification of signing identities, the kinds of artifacts and pipeline
//! stages, and the configuration file that drives a release build.

pub mod config;
pub mod error;
pub mod types;

pub use error::{ConfigError, CoreError, Result};
pub use types::{ArtifactKind, Classification, RetryProfile, StageKind};
