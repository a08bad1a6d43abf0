//! Append-only build manifest
//!
//! The manifest is a JSON document listing every artifact a build produced.
//! Each append rewrites the whole file through a temporary file in the same
//! directory followed by a rename, so readers in other processes only ever
//! see a complete document.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::{resolve, Artifact};
use crate::checksum::{verify, VerifyOutcome};
use crate::error::{ArtifactError, Result};

/// Who wrote the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Generator name and version
    pub generator: String,

    /// Host the build ran on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Provenance {
    /// Provenance for the current process
    pub fn current() -> Self {
        Self {
            generator: format!("gantry/{}", env!("CARGO_PKG_VERSION")),
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok()),
        }
    }
}

/// The manifest document as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub build_id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

/// Handle on a manifest file. The holder is its only writer.
#[derive(Debug)]
pub struct ArtifactManifest {
    path: PathBuf,
    manifest: Manifest,
}

impl ArtifactManifest {
    /// Create a new, empty manifest at `path`.
    ///
    /// Fails with [`ArtifactError::ManifestExists`] rather than replacing a
    /// previous build's manifest.
    pub fn create(
        path: impl Into<PathBuf>,
        build_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Err(ArtifactError::ManifestExists(path));
        }

        let manifest = Manifest {
            build_id: build_id.into(),
            version: version.into(),
            created_at: Utc::now(),
            provenance: Some(Provenance::current()),
            artifacts: Vec::new(),
        };

        let handle = Self { path, manifest };
        handle.persist()?;
        info!(
            path = %handle.path.display(),
            build_id = %handle.manifest.build_id,
            "created manifest"
        );
        Ok(handle)
    }

    /// Open an existing manifest
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ArtifactError::io(&path, e))?;
        let manifest: Manifest =
            serde_json::from_str(&content).map_err(|source| ArtifactError::Json {
                path: path.clone(),
                source,
            })?;
        debug!(
            path = %path.display(),
            artifacts = manifest.artifacts.len(),
            "opened manifest"
        );
        Ok(Self { path, manifest })
    }

    /// Record an artifact and write the manifest through to disk.
    ///
    /// When the write fails the record is dropped again, so the in-memory
    /// document never runs ahead of the file.
    pub fn append(&mut self, artifact: Artifact) -> Result<()> {
        info!(
            manifest = %self.path.display(),
            artifact = %artifact.path.display(),
            size = artifact.size,
            checksum = %artifact.checksum,
            "recording artifact"
        );
        self.manifest.artifacts.push(artifact);
        if let Err(e) = self.persist() {
            self.manifest.artifacts.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Compare every record with the live files under `root`.
    ///
    /// Nothing is modified; mismatches are reported, never corrected.
    pub fn validate(&self, root: &Path) -> ValidationReport {
        validate_manifest(&self.manifest, root)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.manifest.artifacts
    }

    fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| ArtifactError::io(&dir, e))?;

        let json = serde_json::to_vec_pretty(&self.manifest).map_err(|source| {
            ArtifactError::Json {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| ArtifactError::io(&dir, e))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.write_all(b"\n"))
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| ArtifactError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| ArtifactError::io(&self.path, e.error))?;
        Ok(())
    }
}

/// Live state of one recorded artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    Match,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch { expected: String, actual: String },
    Unreadable { reason: String },
}

impl ArtifactStatus {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

impl From<VerifyOutcome> for ArtifactStatus {
    fn from(outcome: VerifyOutcome) -> Self {
        match outcome {
            VerifyOutcome::Match => Self::Match,
            VerifyOutcome::NotFound => Self::Missing,
            VerifyOutcome::SizeMismatch { expected, actual } => {
                Self::SizeMismatch { expected, actual }
            }
            VerifyOutcome::ChecksumMismatch { expected, actual } => {
                Self::ChecksumMismatch { expected, actual }
            }
        }
    }
}

/// Validation result for one record
#[derive(Debug, Clone, Serialize)]
pub struct ValidationEntry {
    pub name: String,
    pub path: PathBuf,
    pub recorded_at: DateTime<Utc>,
    pub status: ArtifactStatus,
    /// A later record exists for the same path; this one does not count
    pub superseded: bool,
}

/// Result of validating a manifest, one entry per record in manifest order
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub build_id: String,
    pub entries: Vec<ValidationEntry>,
}

impl ValidationReport {
    /// Entries that make the report fail
    pub fn failures(&self) -> impl Iterator<Item = &ValidationEntry> {
        self.entries
            .iter()
            .filter(|e| !e.superseded && !e.status.is_match())
    }

    pub fn is_valid(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Turn the first failing entry into an error
    pub fn ensure_valid(&self) -> Result<()> {
        let Some(entry) = self.failures().next() else {
            return Ok(());
        };
        let path = entry.path.clone();
        Err(match &entry.status {
            ArtifactStatus::Missing | ArtifactStatus::Match => ArtifactError::NotFound(path),
            ArtifactStatus::SizeMismatch { expected, actual } => ArtifactError::SizeMismatch {
                path,
                expected: *expected,
                actual: *actual,
            },
            ArtifactStatus::ChecksumMismatch { expected, actual } => {
                ArtifactError::ChecksumMismatch {
                    path,
                    expected: expected.clone(),
                    actual: actual.clone(),
                }
            }
            ArtifactStatus::Unreadable { reason } => ArtifactError::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::Other, reason.clone()),
            },
        })
    }
}

fn validate_manifest(manifest: &Manifest, root: &Path) -> ValidationReport {
    // Walk backwards so the latest record per path is seen first
    let mut seen = HashSet::new();
    let mut superseded = vec![false; manifest.artifacts.len()];
    for (i, artifact) in manifest.artifacts.iter().enumerate().rev() {
        if !seen.insert(artifact.path.as_path()) {
            superseded[i] = true;
        }
    }

    let entries = manifest
        .artifacts
        .iter()
        .zip(superseded)
        .map(|(artifact, superseded)| {
            let location = resolve(root, &artifact.path);
            let status = match verify(&location, artifact.size, &artifact.checksum) {
                Ok(outcome) => outcome.into(),
                Err(e) => ArtifactStatus::Unreadable {
                    reason: e.to_string(),
                },
            };
            if !superseded && !status.is_match() {
                warn!(
                    artifact = %artifact.path.display(),
                    status = ?status,
                    "artifact does not match its manifest record"
                );
            }
            ValidationEntry {
                name: artifact.name.clone(),
                path: artifact.path.clone(),
                recorded_at: artifact.recorded_at,
                status,
                superseded,
            }
        })
        .collect();

    ValidationReport {
        build_id: manifest.build_id.clone(),
        entries,
    }
}
