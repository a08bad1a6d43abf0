//! Pipeline stages

use std::collections::BTreeMap;

use gantry_core::config::{validate_config, Config, ProducedArtifactConfig, StageConfig};
use gantry_core::{Classification, ConfigError, RetryProfile, StageKind};
use gantry_tasks::RetryPolicy;
use regex::Regex;

use crate::error::Result;

/// A validated stage, ready to run
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    /// Program and arguments, placeholders unexpanded
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub identity: Option<Classification>,
    pub success_pattern: Option<Regex>,
    pub retry_profile: RetryProfile,
    pub policy: RetryPolicy,
    pub produces: Vec<ProducedArtifactConfig>,
}

impl Stage {
    /// Build a stage from configuration with the given retry policy
    pub fn new(config: &StageConfig, policy: RetryPolicy) -> Result<Self> {
        let success_pattern = config
            .success_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                ConfigError::invalid(
                    format!("pipeline.stages.{}.success_pattern", config.name),
                    e.to_string(),
                )
            })?;

        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            command: config.command.clone(),
            env: config.env.clone(),
            identity: config.identity,
            success_pattern,
            retry_profile: config.retry_profile(),
            policy,
            produces: config.produces.clone(),
        })
    }

    /// Validate `config` and build its stages in order
    pub fn from_config(config: &Config) -> Result<Vec<Self>> {
        validate_config(config)?;

        config
            .pipeline
            .stages
            .iter()
            .map(|stage| {
                let profile = stage.retry_profile();
                let policy = RetryPolicy::try_from(config.retry.profile(profile)).map_err(|e| {
                    ConfigError::invalid(format!("retry.{:?}", profile).to_lowercase(), e.to_string())
                })?;
                Self::new(stage, policy)
            })
            .collect()
    }

    /// Whether artifacts from this stage are signed unless overridden
    pub fn signs(&self) -> bool {
        self.kind.produces_signed() || self.identity.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::config::{parse_config, DEFAULT_CONFIG_TEMPLATE};

    #[test]
    fn test_from_template_config() {
        let config = parse_config(DEFAULT_CONFIG_TEMPLATE, true).unwrap();
        let stages = Stage::from_config(&config).unwrap();

        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "sign-app", "package", "notarize", "staple"]);

        let notarize = &stages[3];
        assert_eq!(notarize.retry_profile, RetryProfile::Network);
        assert_eq!(
            notarize.policy.max_attempts(),
            config.retry.network.max_attempts
        );
        assert!(notarize
            .success_pattern
            .as_ref()
            .unwrap()
            .is_match("status: Accepted"));

        assert_eq!(stages[0].retry_profile, RetryProfile::Local);
        assert!(!stages[0].signs());
        assert!(stages[2].signs());
    }

    #[test]
    fn test_out_of_order_stages_rejected() {
        let config = parse_config(
            r#"
[[pipeline.stages]]
name = "notarize"
kind = "notarize"
command = ["xcrun", "notarytool"]

[[pipeline.stages]]
name = "build"
kind = "build"
command = ["make"]
"#,
            true,
        )
        .unwrap();

        let err = Stage::from_config(&config).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }
}
