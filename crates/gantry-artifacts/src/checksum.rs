//! SHA-256 checksums of artifact files

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{ArtifactError, Result};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Size and checksum of a file, taken in a single pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Bytes read
    pub size: u64,
    /// Lowercase hex SHA-256
    pub sha256: String,
}

/// Result of comparing a live file against a recorded size and checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Match,
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch { expected: String, actual: String },
    NotFound,
}

impl VerifyOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Stream `path` through SHA-256, counting bytes as they go by
pub fn digest(path: &Path) -> Result<FileDigest> {
    let mut file = File::open(path).map_err(|e| ArtifactError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).map_err(|e| ArtifactError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(FileDigest {
        size,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

/// Lowercase hex SHA-256 of the file at `path`
pub fn checksum(path: &Path) -> Result<String> {
    digest(path).map(|d| d.sha256)
}

/// Compare the file at `path` with a recorded size and checksum.
///
/// The size is checked first so a truncated or grown file is reported
/// without hashing it. Checksums compare case-insensitively.
pub fn verify(path: &Path, expected_size: u64, expected_checksum: &str) -> Result<VerifyOutcome> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VerifyOutcome::NotFound),
        Err(e) => return Err(ArtifactError::io(path, e)),
    };

    if metadata.len() != expected_size {
        return Ok(VerifyOutcome::SizeMismatch {
            expected: expected_size,
            actual: metadata.len(),
        });
    }

    let actual = match digest(path) {
        Ok(d) => d,
        // Removed between the stat and the read
        Err(ArtifactError::NotFound(_)) => return Ok(VerifyOutcome::NotFound),
        Err(e) => return Err(e),
    };

    if actual.size != expected_size {
        return Ok(VerifyOutcome::SizeMismatch {
            expected: expected_size,
            actual: actual.size,
        });
    }

    if actual.sha256.eq_ignore_ascii_case(expected_checksum.trim()) {
        Ok(VerifyOutcome::Match)
    } else {
        Ok(VerifyOutcome::ChecksumMismatch {
            expected: expected_checksum.to_string(),
            actual: actual.sha256,
        })
    }
}
