//! Gantry Artifacts - integrity of build outputs
//!
//! Every file a pipeline produces is fingerprinted with SHA-256 and recorded
//! in an append-only JSON manifest. The manifest is rewritten atomically on
//! each append so a crash loses at most the record being written, and it can
//! be validated later against the files on disk.

pub mod artifact;
pub mod checksum;
pub mod error;
pub mod manifest;

pub use artifact::Artifact;
pub use checksum::{checksum, digest, verify, FileDigest, VerifyOutcome};
pub use error::{ArtifactError, Result};
pub use manifest::{
    ArtifactManifest, ArtifactStatus, Manifest, Provenance, ValidationEntry, ValidationReport,
};
