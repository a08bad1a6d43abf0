//! Configuration validation

use std::collections::HashSet;

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::{Config, RetryPolicyConfig};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_retry_policy("retry.local", &config.retry.local)?;
    validate_retry_policy("retry.network", &config.retry.network)?;
    validate_signing(config)?;
    validate_stages(config)?;
    validate_manifest(config)?;
    debug!("configuration validation passed");
    Ok(())
}

/// Validate a single retry policy
pub fn validate_retry_policy(field: &str, policy: &RetryPolicyConfig) -> Result<()> {
    if policy.max_attempts < 1 {
        return Err(ConfigError::invalid(
            format!("{}.max_attempts", field),
            "must be at least 1",
        )
        .into());
    }

    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(ConfigError::invalid(
            format!("{}.backoff_multiplier", field),
            "must be a finite number >= 1.0",
        )
        .into());
    }

    if policy.per_attempt_timeout_secs == 0 {
        return Err(ConfigError::invalid(
            format!("{}.per_attempt_timeout_secs", field),
            "must be greater than 0",
        )
        .into());
    }

    Ok(())
}

fn validate_signing(config: &Config) -> Result<()> {
    let signing = &config.signing;
    if !signing.enabled {
        return Ok(());
    }

    if signing.keychain.trim().is_empty() {
        return Err(ConfigError::invalid("signing.keychain", "keychain name cannot be empty").into());
    }

    if signing.grant_tools.is_empty() {
        return Err(ConfigError::invalid(
            "signing.grant_tools",
            "at least one signing tool must be granted access",
        )
        .into());
    }

    for (i, bundle) in signing.bundles.iter().enumerate() {
        match (&bundle.path, &bundle.base64_env) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(ConfigError::invalid(
                    format!("signing.bundles[{}]", i),
                    "exactly one of `path` or `base64_env` must be set",
                )
                .into())
            }
        }
    }

    Ok(())
}

fn validate_stages(config: &Config) -> Result<()> {
    let stages = &config.pipeline.stages;
    if !stages.is_empty() {
        debug!(count = stages.len(), "validating stages");
    }

    let mut names = HashSet::new();
    let mut last_rank: Option<(u8, &str)> = None;

    for (i, stage) in stages.iter().enumerate() {
        let field = format!("pipeline.stages[{}]", i);

        if stage.name.trim().is_empty() {
            return Err(ConfigError::invalid(format!("{}.name", field), "stage name cannot be empty").into());
        }

        if !names.insert(stage.name.as_str()) {
            return Err(ConfigError::invalid(
                format!("{}.name", field),
                format!("duplicate stage name '{}'", stage.name),
            )
            .into());
        }

        if stage.command.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(ConfigError::invalid(format!("{}.command", field), "command cannot be empty").into());
        }

        if let Some(rank) = stage.kind.rank() {
            if let Some((prev_rank, prev_name)) = last_rank {
                if rank < prev_rank {
                    return Err(ConfigError::invalid(
                        format!("{}.kind", field),
                        format!(
                            "{} stage '{}' cannot run after stage '{}'",
                            stage.kind, stage.name, prev_name
                        ),
                    )
                    .into());
                }
            }
            last_rank = Some((rank, stage.name.as_str()));
        }

        if let Some(pattern) = &stage.success_pattern {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::invalid(
                    format!("{}.success_pattern", field),
                    e.to_string(),
                )
                .into());
            }
        }

        for (j, produced) in stage.produces.iter().enumerate() {
            if produced.path.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("{}.produces[{}].path", field, j),
                    "path cannot be empty",
                )
                .into());
            }
        }
    }

    Ok(())
}

fn validate_manifest(config: &Config) -> Result<()> {
    if config.manifest.path.trim().is_empty() {
        return Err(ConfigError::invalid("manifest.path", "path cannot be empty").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BundleConfig, StageConfig};
    use crate::types::StageKind;

    fn stage(name: &str, kind: StageKind) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            kind,
            command: vec!["true".to_string()],
            retry: None,
            identity: None,
            success_pattern: None,
            env: Default::default(),
            produces: Vec::new(),
        }
    }

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_retry_policy_bounds() {
        let mut config = Config::default();
        config.retry.local.backoff_multiplier = 0.5;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.retry.network.max_attempts = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.retry.network.backoff_multiplier = f64::NAN;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_stage_order() {
        let mut config = Config::default();
        config.pipeline.stages = vec![
            stage("build", StageKind::Build),
            stage("lint", StageKind::Custom),
            stage("sign", StageKind::Sign),
            stage("sign-helper", StageKind::Sign),
            stage("notarize", StageKind::Notarize),
        ];
        assert!(validate_config(&config).is_ok());

        config.pipeline.stages = vec![
            stage("build", StageKind::Build),
            stage("notarize", StageKind::Notarize),
            stage("package", StageKind::Package),
        ];
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("package"));
        assert!(err.contains("notarize"));
    }

    #[test]
    fn test_validate_duplicate_and_empty_stages() {
        let mut config = Config::default();
        config.pipeline.stages = vec![stage("build", StageKind::Build), stage("build", StageKind::Sign)];
        assert!(validate_config(&config).is_err());

        let mut empty = stage("build", StageKind::Build);
        empty.command.clear();
        config.pipeline.stages = vec![empty];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_success_pattern() {
        let mut config = Config::default();
        let mut notarize = stage("notarize", StageKind::Notarize);
        notarize.success_pattern = Some("status: (Accepted".to_string());
        config.pipeline.stages = vec![notarize];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_bundle_sources() {
        let mut config = Config::default();
        config.signing.enabled = true;
        config.signing.bundles = vec![BundleConfig::default()];
        assert!(validate_config(&config).is_err());

        config.signing.bundles = vec![BundleConfig {
            path: Some("cert.p12".into()),
            base64_env: None,
            password_env: None,
        }];
        assert!(validate_config(&config).is_ok());
    }
}
