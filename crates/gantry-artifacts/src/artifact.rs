//! Artifact records

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gantry_core::ArtifactKind;
use serde::{Deserialize, Serialize};

use crate::checksum::digest;
use crate::error::Result;

/// A produced file as recorded in the manifest.
///
/// Records are immutable once appended; a correction is a new record for the
/// same path with a later `recorded_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Display name
    pub name: String,

    /// Path as given, usually relative to the build's working directory
    pub path: PathBuf,

    /// Kind of artifact
    #[serde(rename = "type")]
    pub kind: ArtifactKind,

    /// Size in bytes
    pub size: u64,

    /// Lowercase hex SHA-256
    pub checksum: String,

    /// Whether the artifact carries a signature
    pub signed: bool,

    /// Whether the artifact passed notarization
    pub notarized: bool,

    /// When the record was made
    pub recorded_at: DateTime<Utc>,

    /// Pipeline stage that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// Identity used to sign it (fingerprint or label)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_identity: Option<String>,
}

impl Artifact {
    /// Fingerprint the file at `path` (resolved against `root` when relative).
    ///
    /// The kind is inferred from the file name and the name defaults to it.
    pub fn from_file(root: &Path, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_digest = digest(&resolve(root, &path))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            name,
            kind: ArtifactKind::from_path(&path),
            path,
            size: file_digest.size,
            checksum: file_digest.sha256,
            signed: false,
            notarized: false,
            recorded_at: Utc::now(),
            stage: None,
            signing_identity: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kind(mut self, kind: ArtifactKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    pub fn with_notarized(mut self, notarized: bool) -> Self {
        self.notarized = notarized;
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_signing_identity(mut self, identity: impl Into<String>) -> Self {
        self.signing_identity = Some(identity.into());
        self
    }

    /// Location of the file for a build rooted at `root`
    pub fn location(&self, root: &Path) -> PathBuf {
        resolve(root, &self.path)
    }
}

pub(crate) fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
