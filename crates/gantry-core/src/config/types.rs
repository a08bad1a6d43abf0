//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::{ArtifactKind, Classification, RetryProfile, StageKind};

/// Main configuration for Gantry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Project name
    pub name: Option<String>,

    /// Code signing session configuration
    pub signing: SigningConfig,

    /// Retry policy profiles
    pub retry: RetryConfig,

    /// Ordered pipeline stages
    pub pipeline: PipelineConfig,

    /// Build manifest configuration
    pub manifest: ManifestConfig,
}

/// Signing session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Whether a signing session is set up for the build
    pub enabled: bool,

    /// Name of the ephemeral keychain created for the session
    pub keychain: String,

    /// Path to the platform identity-store tool
    pub security_path: PathBuf,

    /// Team identifier used to narrow identity lookups
    pub team_id: Option<String>,

    /// Certificate bundles imported into the session keychain
    pub bundles: Vec<BundleConfig>,

    /// Environment variable holding the default bundle password
    pub password_env: String,

    /// Environment variable holding the keychain unlock secret.
    /// A random secret is generated when unset.
    pub keychain_secret_env: Option<String>,

    /// Tools granted non-interactive access to the imported keys
    pub grant_tools: Vec<String>,

    /// Keychain auto-lock timeout in seconds
    pub lock_timeout_secs: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            keychain: "gantry-signing.keychain-db".to_string(),
            security_path: PathBuf::from("/usr/bin/security"),
            team_id: None,
            bundles: Vec::new(),
            password_env: "GANTRY_CERTIFICATE_PASSWORD".to_string(),
            keychain_secret_env: None,
            grant_tools: vec![
                "/usr/bin/codesign".to_string(),
                "/usr/bin/productsign".to_string(),
            ],
            lock_timeout_secs: 21600,
        }
    }
}

/// A certificate bundle (PKCS#12) to import
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Path to a .p12 file
    pub path: Option<PathBuf>,

    /// Environment variable holding the base64-encoded bundle
    pub base64_env: Option<String>,

    /// Environment variable holding this bundle's password
    /// (falls back to `signing.password_env`)
    pub password_env: Option<String>,
}

/// Retry policy profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Policy for local tools
    pub local: RetryPolicyConfig,

    /// Policy for network-facing tools
    pub network: RetryPolicyConfig,
}

impl RetryConfig {
    /// Get the policy for a profile
    pub fn profile(&self, profile: RetryProfile) -> &RetryPolicyConfig {
        match profile {
            RetryProfile::Local => &self.local,
            RetryProfile::Network => &self.network,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            local: RetryPolicyConfig {
                max_attempts: 2,
                initial_delay_ms: 1_000,
                backoff_multiplier: 2.0,
                per_attempt_timeout_secs: 1_800,
            },
            network: RetryPolicyConfig {
                max_attempts: 5,
                initial_delay_ms: 15_000,
                backoff_multiplier: 2.0,
                per_attempt_timeout_secs: 2_700,
            },
        }
    }
}

/// Raw retry policy values as they appear in configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Total attempts including the first one
    #[serde(alias = "maxAttempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    #[serde(alias = "initialDelay")]
    pub initial_delay_ms: u64,

    /// Factor applied to the delay after every failed attempt
    #[serde(alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,

    /// Wall-clock limit for a single attempt, in seconds
    #[serde(alias = "perAttemptTimeout")]
    pub per_attempt_timeout_secs: u64,
}

/// Pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory stage commands run in (defaults to the config directory)
    pub working_dir: Option<PathBuf>,

    /// Stages in execution order
    pub stages: Vec<StageConfig>,
}

/// A single pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, unique within the pipeline
    pub name: String,

    /// Stage kind
    pub kind: StageKind,

    /// Program and arguments. Supports `{version}`, `{build_id}`,
    /// `{identity}`, `{keychain}` and `{workdir}` placeholders.
    pub command: Vec<String>,

    /// Retry profile (defaults by stage kind)
    #[serde(default)]
    pub retry: Option<RetryProfile>,

    /// Identity class the stage needs, exposed as `{identity}`
    #[serde(default)]
    pub identity: Option<Classification>,

    /// Regex that stdout must match for an attempt to count as success
    #[serde(default)]
    pub success_pattern: Option<String>,

    /// Extra environment variables for the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Files this stage produces
    #[serde(default)]
    pub produces: Vec<ProducedArtifactConfig>,
}

impl StageConfig {
    /// Effective retry profile
    pub fn retry_profile(&self) -> RetryProfile {
        self.retry
            .unwrap_or_else(|| self.kind.default_retry_profile())
    }
}

/// An artifact a stage is expected to produce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducedArtifactConfig {
    /// Path (relative to the working directory), placeholders allowed
    pub path: String,

    /// Display name (defaults to the file name)
    #[serde(default)]
    pub name: Option<String>,

    /// Artifact kind (inferred from the extension when unset)
    #[serde(default)]
    pub kind: Option<ArtifactKind>,

    /// Override the signed flag implied by the stage kind
    #[serde(default)]
    pub signed: Option<bool>,

    /// Override the notarized flag implied by the stage kind
    #[serde(default)]
    pub notarized: Option<bool>,
}

/// Build manifest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Manifest path template, relative to the working directory
    pub path: String,

    /// Build identifier template; a unique id is generated when unset
    pub build_id: Option<String>,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            path: "artifacts/manifest-{build_id}.json".to_string(),
            build_id: None,
        }
    }
}
