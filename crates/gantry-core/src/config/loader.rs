//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, CoreError, Result};

use super::defaults::config_file_names;
use super::types::Config;
use super::validation::validate_config;

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<Config> {
    let format = if path.extension().is_some_and(|e| e == "toml") {
        "TOML"
    } else {
        "YAML"
    };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(|source| CoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&content, format == "TOML")?;

    validate_config(&config)?;
    debug!(path = %path.display(), "config loaded and validated");
    Ok(config)
}

/// Parse configuration text without validating it
pub fn parse_config(content: &str, toml_format: bool) -> Result<Config> {
    let config: Config = if toml_format {
        toml::from_str(content).map_err(ConfigError::Toml)?
    } else {
        serde_yaml::from_str(content).map_err(ConfigError::Yaml)?
    };
    Ok(config)
}

/// Find configuration file in directory or parent directories.
///
/// At each directory level the search checks:
///   1. `<dir>/<name>`          (e.g. `gantry.toml`)
///   2. `<dir>/.github/<name>`  (e.g. `.github/gantry.toml`)
///
/// The first match wins. Parents are walked until the filesystem root.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found config file");
                return Some(config_path);
            }

            let github_path = current.join(".github").join(name);
            if github_path.exists() {
                info!(path = %github_path.display(), "found config file in .github/");
                return Some(github_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no config file found");
    None
}

/// Load configuration from directory (searching parent directories)
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let config = load_config(&config_path)?;
    Ok((config, config_path))
}

/// Load configuration or use defaults
pub fn load_config_or_default(dir: &Path) -> (Config, Option<PathBuf>) {
    match load_config_from_dir(dir) {
        Ok((config, path)) => (config, Some(path)),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "no usable config found, using defaults");
            (Config::default(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFIG_TEMPLATE;
    use crate::types::{Classification, RetryProfile, StageKind};
    use tempfile::TempDir;

    #[test]
    fn test_find_config_walks_parents() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("gantry.toml");
        std::fs::write(&config_path, "name = \"demo\"").unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config(&nested);
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_in_github_dir() {
        let temp = TempDir::new().unwrap();
        let github_dir = temp.path().join(".github");
        std::fs::create_dir_all(&github_dir).unwrap();
        let config_path = github_dir.join("gantry.yaml");
        std::fs::write(&config_path, "name: demo\n").unwrap();

        assert_eq!(find_config(temp.path()), Some(config_path));
    }

    #[test]
    fn test_template_loads_and_validates() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("gantry.toml");
        std::fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE).unwrap();

        let config = load_config(&config_path).unwrap();
        assert!(config.signing.enabled);
        assert_eq!(config.signing.bundles.len(), 2);
        assert_eq!(config.pipeline.stages.len(), 5);

        let package = &config.pipeline.stages[2];
        assert_eq!(package.kind, StageKind::Package);
        assert_eq!(package.identity, Some(Classification::InstallerSigning));

        let notarize = &config.pipeline.stages[3];
        assert_eq!(notarize.retry_profile(), RetryProfile::Network);
    }

    #[test]
    fn test_load_yaml_with_camel_case_retry_keys() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("gantry.yaml");
        std::fs::write(
            &config_path,
            r#"
retry:
  network:
    maxAttempts: 7
    initialDelay: 500
    backoffMultiplier: 1.5
    perAttemptTimeout: 60
pipeline:
  stages:
    - name: build
      kind: build
      command: ["make"]
"#,
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.retry.network.max_attempts, 7);
        assert_eq!(config.retry.network.initial_delay_ms, 500);
        assert_eq!(config.retry.local.max_attempts, 2);
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("gantry.toml");
        std::fs::write(
            &config_path,
            "[retry.local]\nmax_attempts = 0\ninitial_delay_ms = 1\nbackoff_multiplier = 2.0\nper_attempt_timeout_secs = 1\n",
        )
        .unwrap();

        assert!(load_config(&config_path).is_err());
    }
}
