//! Per-run orchestrator settings
//!
//! Values that differ between runs of the same configuration: where the
//! build runs, the version being built and the build identifier.

use std::path::{Path, PathBuf};

use gantry_core::config::Config;
use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::template::TemplateContext;

/// Settings for one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorConfig {
    /// Directory stage commands run in; relative artifact paths resolve here
    pub working_dir: PathBuf,

    /// Version being built
    pub version: String,

    /// Unique build identifier
    pub build_id: String,

    /// Manifest file location
    pub manifest_path: PathBuf,

    /// Team identifier narrowing identity lookups
    pub team_id: Option<String>,
}

impl OrchestratorConfig {
    /// Derive run settings from configuration.
    ///
    /// `root` is the directory holding the configuration file. A missing
    /// `build_id` is taken from `manifest.build_id` or generated.
    pub fn resolve(
        config: &Config,
        root: &Path,
        version: impl Into<String>,
        build_id: Option<String>,
        team_id: Option<String>,
    ) -> Result<Self> {
        let version = version.into();
        let working_dir = working_dir(config, root);

        let partial = TemplateContext {
            version: version.clone(),
            workdir: working_dir.clone(),
            ..Default::default()
        };
        let build_id = match (build_id, &config.manifest.build_id) {
            (Some(id), _) => id,
            (None, Some(template)) => partial.expand(template).map_err(|message| {
                PipelineError::Template {
                    stage: "manifest.build_id".to_string(),
                    message,
                }
            })?,
            (None, None) => generate_build_id(),
        };

        let context = TemplateContext {
            build_id: build_id.clone(),
            ..partial
        };
        let manifest_path = PathBuf::from(context.expand(&config.manifest.path).map_err(
            |message| PipelineError::Template {
                stage: "manifest.path".to_string(),
                message,
            },
        )?);
        let manifest_path = if manifest_path.is_absolute() {
            manifest_path
        } else {
            working_dir.join(manifest_path)
        };

        Ok(Self {
            working_dir,
            version,
            build_id,
            manifest_path,
            team_id: team_id.or_else(|| config.signing.team_id.clone()),
        })
    }
}

/// Directory stage commands run in, for a configuration file in `root`
pub fn working_dir(config: &Config, root: &Path) -> PathBuf {
    match &config.pipeline.working_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => root.join(dir),
        None => root.to_path_buf(),
    }
}

/// Sortable, unique build identifier
fn generate_build_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ"),
        &suffix[..8]
    )
}
