//! CLI definition and command handling

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::debug;

use gantry_core::config::{load_config, load_config_from_dir, load_config_or_default, Config};

use commands::{BuildCommand, ChecksumCommand, IdentityCommand, ManifestCommand};

/// Gantry - signed, notarized release builds
#[derive(Debug, Parser)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    /// Configuration file (searched for from the working directory if unset)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the release pipeline
    Build(BuildCommand),

    /// Inspect and validate build manifests
    Manifest(ManifestCommand),

    /// List and resolve signing identities
    Identity(IdentityCommand),

    /// Print or verify a file's SHA-256 checksum
    Checksum(ChecksumCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<()> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)
                .with_context(|| format!("cannot change to {}", dir.display()))?;
        }

        match self.command {
            Commands::Build(ref cmd) => cmd.execute(&self),
            Commands::Manifest(ref cmd) => cmd.execute(&self),
            Commands::Identity(ref cmd) => cmd.execute(&self),
            Commands::Checksum(ref cmd) => cmd.execute(&self),
        }
    }

    /// Load the configuration, returning it with the directory it applies to
    pub fn load_config(&self) -> anyhow::Result<(Config, PathBuf)> {
        let cwd = std::env::current_dir()?;
        let (config, path) = match &self.config {
            Some(path) => {
                let config = load_config(path)
                    .with_context(|| format!("cannot load {}", path.display()))?;
                (config, path.clone())
            }
            None => load_config_from_dir(&cwd)?,
        };
        debug!(path = %path.display(), "using configuration");
        Ok((config, config_root(&path, &cwd)))
    }

    /// Like [`load_config`](Self::load_config), falling back to defaults
    pub fn load_config_or_default(&self) -> anyhow::Result<(Config, PathBuf)> {
        if self.config.is_some() {
            return self.load_config();
        }
        let cwd = std::env::current_dir()?;
        let (config, path) = load_config_or_default(&cwd);
        let root = path.map_or_else(|| cwd.clone(), |p| config_root(&p, &cwd));
        Ok((config, root))
    }

    pub fn is_text(&self) -> bool {
        self.format == OutputFormat::Text && !self.quiet
    }
}

/// Directory a configuration file applies to. A file under `.github/`
/// applies to the repository root.
fn config_root(path: &Path, cwd: &Path) -> PathBuf {
    let dir = match path.parent() {
        Some(dir) if dir.as_os_str().is_empty() => cwd.to_path_buf(),
        Some(dir) => dir.to_path_buf(),
        None => cwd.to_path_buf(),
    };
    let dir = if dir.is_absolute() { dir } else { cwd.join(dir) };
    if dir.file_name().is_some_and(|n| n == ".github") {
        dir.parent().map(Path::to_path_buf).unwrap_or(dir)
    } else {
        dir
    }
}
