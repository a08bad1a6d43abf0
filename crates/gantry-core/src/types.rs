//! Core types shared across Gantry crates

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::ConfigError;

/// Class of signing identity a tool needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Signs application bundles and executables (codesign)
    #[serde(alias = "application", alias = "ApplicationSigning")]
    ApplicationSigning,
    /// Signs installer packages (productsign / productbuild)
    #[serde(alias = "installer", alias = "InstallerSigning")]
    InstallerSigning,
    /// Anything else; must be narrowed with a label constraint
    #[serde(alias = "Other")]
    Other,
}

impl Classification {
    /// The canonical label fragment the platform uses for this class
    pub fn canonical_label(&self) -> Option<&'static str> {
        match self {
            Self::ApplicationSigning => Some("Developer ID Application"),
            Self::InstallerSigning => Some("Developer ID Installer"),
            Self::Other => None,
        }
    }

    /// Looser label fragments, most specific first.
    ///
    /// Stores sometimes register certificates under the App Store family
    /// names or only a generic vendor prefix.
    pub fn broadened_labels(&self) -> &'static [&'static str] {
        match self {
            Self::ApplicationSigning => &[
                "3rd Party Mac Developer Application",
                "Apple Distribution",
                "Developer ID",
                "Apple",
            ],
            Self::InstallerSigning => &[
                "3rd Party Mac Developer Installer",
                "Mac Installer Distribution",
                "Developer ID",
                "Apple",
            ],
            Self::Other => &[],
        }
    }

    /// Infer the classification from a store label
    pub fn from_label(label: &str) -> Self {
        if label.contains("Developer ID Application")
            || label.contains("3rd Party Mac Developer Application")
            || label.contains("Apple Distribution")
        {
            Self::ApplicationSigning
        } else if label.contains("Developer ID Installer")
            || label.contains("3rd Party Mac Developer Installer")
            || label.contains("Mac Installer Distribution")
        {
            Self::InstallerSigning
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApplicationSigning => write!(f, "ApplicationSigning"),
            Self::InstallerSigning => write!(f, "InstallerSigning"),
            Self::Other => write!(f, "Other"),
        }
    }
}

impl FromStr for Classification {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "applicationsigning" | "application" | "app" | "codesign" => {
                Ok(Self::ApplicationSigning)
            }
            "installersigning" | "installer" | "pkg" | "productsign" => {
                Ok(Self::InstallerSigning)
            }
            "other" => Ok(Self::Other),
            _ => Err(ConfigError::invalid(
                "classification",
                format!("unknown identity classification '{}'", s),
            )),
        }
    }
}

/// Kind of build artifact recorded in a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Application bundle (.app, zipped or not)
    AppBundle,
    /// Installer package (.pkg)
    Installer,
    /// Disk image (.dmg)
    DiskImage,
    /// Anything else
    Other,
}

impl ArtifactKind {
    /// Infer artifact kind from file path
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_lowercase();

        if name.ends_with(".app") || name.ends_with(".app.zip") {
            Self::AppBundle
        } else if name.ends_with(".pkg") || name.ends_with(".mpkg") {
            Self::Installer
        } else if name.ends_with(".dmg") {
            Self::DiskImage
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppBundle => write!(f, "app_bundle"),
            Self::Installer => write!(f, "installer"),
            Self::DiskImage => write!(f, "disk_image"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Kind of pipeline stage
///
/// Stages consume the previous stage's output, so the ordered kinds must
/// appear in non-decreasing [`StageKind::rank`] order in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Compile / bundle the application
    Build,
    /// Sign binaries and bundles
    Sign,
    /// Produce installer packages or disk images
    Package,
    /// Submit to the notarization service and wait for a verdict
    Notarize,
    /// Attach the notarization ticket
    Staple,
    /// Upload the final artifacts
    Publish,
    /// Free-form step; may appear anywhere
    Custom,
}

impl StageKind {
    /// Position in the release order, `None` for unordered custom stages
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Build => Some(0),
            Self::Sign => Some(1),
            Self::Package => Some(2),
            Self::Notarize => Some(3),
            Self::Staple => Some(4),
            Self::Publish => Some(5),
            Self::Custom => None,
        }
    }

    /// Retry profile used when a stage does not name one
    pub fn default_retry_profile(&self) -> RetryProfile {
        match self {
            Self::Notarize | Self::Publish => RetryProfile::Network,
            _ => RetryProfile::Local,
        }
    }

    /// Whether artifacts produced by this stage are signed by default
    pub fn produces_signed(&self) -> bool {
        matches!(
            self,
            Self::Sign | Self::Notarize | Self::Staple | Self::Publish
        )
    }

    /// Whether artifacts produced by this stage are notarized by default
    pub fn produces_notarized(&self) -> bool {
        matches!(self, Self::Notarize | Self::Staple | Self::Publish)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Sign => "sign",
            Self::Package => "package",
            Self::Notarize => "notarize",
            Self::Staple => "staple",
            Self::Publish => "publish",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named retry policy profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryProfile {
    /// Local tools: compilers, packagers, codesign
    Local,
    /// Network-facing tools: notarization, uploads
    Network,
}
