//! Manifest command - inspect and validate build manifests

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use console::style;
use tracing::info;

use gantry_artifacts::{ArtifactManifest, ArtifactStatus, ValidationEntry};
use gantry_pipeline::working_dir;

use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Build manifest commands
#[derive(Debug, Args)]
pub struct ManifestCommand {
    #[command(subcommand)]
    pub command: ManifestSubcommand,
}

/// Manifest subcommands
#[derive(Debug, Subcommand)]
pub enum ManifestSubcommand {
    /// Check every recorded artifact against the file on disk
    Validate(ValidateCommand),

    /// Print the recorded artifacts
    Show(ShowCommand),
}

/// Validate a manifest
#[derive(Debug, Args)]
pub struct ValidateCommand {
    /// Manifest file
    #[arg(required = true)]
    pub manifest: PathBuf,

    /// Directory relative artifact paths resolve against
    /// (defaults to the configured working directory)
    #[arg(long)]
    pub root: Option<PathBuf>,
}

/// Show a manifest
#[derive(Debug, Args)]
pub struct ShowCommand {
    /// Manifest file
    #[arg(required = true)]
    pub manifest: PathBuf,
}

impl ManifestCommand {
    /// Execute the manifest command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        match &self.command {
            ManifestSubcommand::Validate(cmd) => cmd.execute(cli),
            ManifestSubcommand::Show(cmd) => cmd.execute(cli),
        }
    }
}

impl ValidateCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(manifest = %self.manifest.display(), "executing manifest validate command");
        let root = match &self.root {
            Some(root) => root.clone(),
            None => {
                let (config, config_root) = cli.load_config_or_default()?;
                working_dir(&config, &config_root)
            }
        };

        let manifest = ArtifactManifest::open(&self.manifest)?;
        let report = manifest.validate(&root);
        let valid = report.is_valid();

        match cli.format {
            OutputFormat::Json => {
                output::json(&serde_json::json!({
                    "valid": valid,
                    "manifest": self.manifest,
                    "root": root,
                    "report": report,
                }))?;
            }
            OutputFormat::Text => {
                if !cli.quiet {
                    println!("{}", output::header("Manifest Validation"));
                    println!("{}", output::key_value("Build", &report.build_id));
                    println!("{}", output::key_value("Root", &display(&root)));
                    println!();
                    for entry in &report.entries {
                        print_entry(entry);
                    }
                    println!();
                }

                let failures = report.failures().count();
                if valid {
                    output::success(&format!(
                        "All {} artifact(s) match",
                        report.entries.iter().filter(|e| !e.superseded).count()
                    ));
                } else {
                    output::error(&format!("{} artifact(s) failed validation", failures));
                }
            }
        }

        if !valid {
            std::process::exit(exit_codes::INTEGRITY_ERROR);
        }
        Ok(())
    }
}

fn print_entry(entry: &ValidationEntry) {
    let path = output::path_style().apply_to(entry.path.display());
    if entry.superseded {
        println!("  {} {} {}", style("-").dim(), path, style("(superseded)").dim());
        return;
    }

    match &entry.status {
        ArtifactStatus::Match => println!("  {} {}", style("✓").green(), path),
        ArtifactStatus::Missing => println!("  {} {} missing", style("✗").red(), path),
        ArtifactStatus::SizeMismatch { expected, actual } => println!(
            "  {} {} size {} != recorded {}",
            style("✗").red(),
            path,
            actual,
            expected
        ),
        ArtifactStatus::ChecksumMismatch { expected, actual } => println!(
            "  {} {} checksum {} != recorded {}",
            style("✗").red(),
            path,
            actual,
            expected
        ),
        ArtifactStatus::Unreadable { reason } => {
            println!("  {} {} unreadable: {}", style("✗").red(), path, reason)
        }
    }
}

impl ShowCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let manifest = ArtifactManifest::open(&self.manifest)?;
        let contents = manifest.manifest();

        if cli.format == OutputFormat::Json {
            return output::json(contents);
        }
        if cli.quiet {
            return Ok(());
        }

        println!("{}", output::header(&format!("Build {}", contents.build_id)));
        println!(
            "{}",
            output::key_value(
                "Version",
                &output::version_style().apply_to(&contents.version).to_string()
            )
        );
        println!("{}", output::key_value("Created", &contents.created_at.to_rfc3339()));
        if let Some(provenance) = &contents.provenance {
            let generated_by = match &provenance.host {
                Some(host) => format!("{} on {}", provenance.generator, host),
                None => provenance.generator.clone(),
            };
            println!("{}", output::key_value("Generated by", &generated_by));
        }
        println!();

        if contents.artifacts.is_empty() {
            output::info("No artifacts recorded");
            return Ok(());
        }
        for artifact in &contents.artifacts {
            println!(
                "  {} ({} bytes)",
                output::path_style().apply_to(artifact.path.display()),
                artifact.size
            );
            println!("{}", output::key_value("  sha256", &artifact.checksum));
            println!(
                "{}",
                output::key_value(
                    "  signed / notarized",
                    &format!("{} / {}", output::flag(artifact.signed), output::flag(artifact.notarized))
                )
            );
            if let Some(stage) = &artifact.stage {
                println!("{}", output::key_value("  stage", stage));
            }
        }
        Ok(())
    }
}

fn display(path: &Path) -> String {
    output::path_style().apply_to(path.display()).to_string()
}
