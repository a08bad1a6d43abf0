//! Signing identity types

use chrono::{DateTime, Utc};
use gantry_core::Classification;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which identities a store listing includes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingPolicy {
    /// Identities valid for code signing
    CodeSigning,
    /// Every identity with a private key (installer certificates are not
    /// code-signing identities)
    Basic,
}

impl ListingPolicy {
    /// Policy that lists identities of the given class
    pub fn for_classification(classification: Classification) -> Self {
        match classification {
            Classification::ApplicationSigning => Self::CodeSigning,
            Classification::InstallerSigning | Classification::Other => Self::Basic,
        }
    }

    /// Name the `security` tool uses for this policy
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeSigning => "codesigning",
            Self::Basic => "basic",
        }
    }
}

/// One identity as listed by a store, in store order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Store-assigned fingerprint (SHA-1 hex for the macOS keychain)
    pub fingerprint: String,

    /// Display label
    pub label: String,

    /// The raw listing line the record was parsed from
    pub raw: String,

    /// Certificate expiry, when the store reports it
    pub not_after: Option<DateTime<Utc>>,
}

impl IdentityRecord {
    pub fn new(fingerprint: impl Into<String>, label: impl Into<String>) -> Self {
        let fingerprint = fingerprint.into();
        let label = label.into();
        Self {
            raw: format!("{} \"{}\"", fingerprint, label),
            fingerprint,
            label,
            not_after: None,
        }
    }

    pub fn with_not_after(mut self, not_after: DateTime<Utc>) -> Self {
        self.not_after = Some(not_after);
        self
    }

    /// Check if the certificate is expired
    pub fn is_expired(&self) -> bool {
        self.not_after.map(|t| t < Utc::now()).unwrap_or(false)
    }

    /// Team ID from the trailing parenthesised part of the label
    pub fn team_id(&self) -> Option<String> {
        team_id_from_label(&self.label)
    }

    /// Parse a line of `security find-identity` output.
    ///
    /// Format: `  1) FINGERPRINT "Name" (optional status)`. The summary
    /// line and policy headers do not parse.
    pub fn parse_listing_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        let (index, rest) = trimmed.split_once(')')?;
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let rest = rest.trim_start();
        let (fingerprint, rest) = rest.split_once(' ')?;
        if fingerprint.len() != 40 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        let name_start = rest.find('"')?;
        let name_end = rest.rfind('"')?;
        if name_end <= name_start {
            return None;
        }
        let label = rest[name_start + 1..name_end].to_string();

        Some(Self {
            fingerprint: fingerprint.to_uppercase(),
            label,
            raw: trimmed.to_string(),
            not_after: None,
        })
    }
}

/// Extract the team ID from a label like `Developer ID Application: X (ABC123)`
pub fn team_id_from_label(label: &str) -> Option<String> {
    let start = label.rfind('(')?;
    let end = label.rfind(')')?;
    if end <= start + 1 {
        return None;
    }
    let team = &label[start + 1..end];
    if team.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(team.to_string())
    } else {
        None
    }
}

/// The cascade step that produced an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStep {
    /// Canonical label, narrowed by team when one was given
    Canonical,
    /// Canonical label with the team constraint dropped
    CanonicalWithoutTeam,
    /// Canonical search over raw listing lines, referenced by fingerprint
    Fingerprint,
    /// Looser label markers
    Broadened,
    /// Looser markers over raw listing lines, referenced by fingerprint
    BroadenedFingerprint,
}

impl CascadeStep {
    /// Cascade steps in the order they are tried
    pub const ALL: [CascadeStep; 5] = [
        Self::Canonical,
        Self::CanonicalWithoutTeam,
        Self::Fingerprint,
        Self::Broadened,
        Self::BroadenedFingerprint,
    ];

    /// Whether tools should be pointed at the fingerprint instead of the label
    pub fn references_fingerprint(&self) -> bool {
        matches!(self, Self::Fingerprint | Self::BroadenedFingerprint)
    }

    /// Whether the step matches looser markers than the canonical label
    pub fn is_broadened(&self) -> bool {
        matches!(self, Self::Broadened | Self::BroadenedFingerprint)
    }
}

impl fmt::Display for CascadeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Canonical => "canonical",
            Self::CanonicalWithoutTeam => "canonical-without-team",
            Self::Fingerprint => "fingerprint",
            Self::Broadened => "broadened",
            Self::BroadenedFingerprint => "broadened-fingerprint",
        };
        write!(f, "{}", name)
    }
}

/// A resolved signing identity.
///
/// Discovered from the store for a single resolution; never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Display label
    pub label: String,

    /// Store-assigned fingerprint
    pub fingerprint: String,

    /// Class requested when the identity was resolved
    pub classification: Classification,

    /// Team ID parsed from the label
    pub team_id: Option<String>,

    /// Certificate expiry
    pub not_after: Option<DateTime<Utc>>,

    /// Cascade step that selected the identity
    pub resolved_by: CascadeStep,

    /// Store the identity lives in, when not the default search list
    pub keychain: Option<String>,
}

impl Identity {
    pub(crate) fn from_record(
        record: &IdentityRecord,
        classification: Classification,
        resolved_by: CascadeStep,
        keychain: Option<&str>,
    ) -> Self {
        Self {
            label: record.label.clone(),
            fingerprint: record.fingerprint.clone(),
            classification,
            team_id: record.team_id(),
            not_after: record.not_after,
            resolved_by,
            keychain: keychain.map(str::to_string),
        }
    }

    /// Value to hand to signing tools (`codesign --sign`, `productsign --sign`)
    pub fn tool_reference(&self) -> &str {
        if self.resolved_by.references_fingerprint() {
            &self.fingerprint
        } else {
            &self.label
        }
    }

    /// Get a display string for the identity
    pub fn display_name(&self) -> String {
        format!("{} [{}]", self.label, self.fingerprint)
    }
}
