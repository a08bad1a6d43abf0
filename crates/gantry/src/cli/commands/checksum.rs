//! Checksum command

use std::path::PathBuf;

use clap::Args;
use console::style;
use tracing::info;

use gantry_artifacts::{digest, verify, VerifyOutcome};

use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Print a file's size and SHA-256, or check them against expected values
#[derive(Debug, Args)]
pub struct ChecksumCommand {
    /// File to fingerprint
    #[arg(required = true)]
    pub file: PathBuf,

    /// Expected SHA-256 (hex)
    #[arg(long, value_name = "SHA256")]
    pub expect: Option<String>,

    /// Expected size in bytes (requires --expect)
    #[arg(long, requires = "expect")]
    pub size: Option<u64>,
}

impl ChecksumCommand {
    /// Execute the checksum command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(file = %self.file.display(), verify = self.expect.is_some(), "executing checksum command");

        let Some(expected) = &self.expect else {
            let file_digest = digest(&self.file)?;
            match cli.format {
                OutputFormat::Json => output::json(&serde_json::json!({
                    "path": self.file,
                    "size": file_digest.size,
                    "sha256": file_digest.sha256,
                }))?,
                OutputFormat::Text => println!("{}  {}", file_digest.sha256, self.file.display()),
            }
            return Ok(());
        };

        // Without an expected size only the checksum is compared
        let size = match self.size {
            Some(size) => size,
            None => std::fs::metadata(&self.file).map(|m| m.len()).unwrap_or(0),
        };
        let outcome = verify(&self.file, size, expected)?;

        if cli.format == OutputFormat::Json {
            let (status, actual) = match &outcome {
                VerifyOutcome::Match => ("match", None),
                VerifyOutcome::NotFound => ("missing", None),
                VerifyOutcome::SizeMismatch { actual, .. } => ("size_mismatch", Some(actual.to_string())),
                VerifyOutcome::ChecksumMismatch { actual, .. } => ("checksum_mismatch", Some(actual.clone())),
            };
            output::json(&serde_json::json!({
                "path": self.file,
                "status": status,
                "actual": actual,
            }))?;
        } else {
            match &outcome {
                VerifyOutcome::Match => {
                    if !cli.quiet {
                        output::success(&format!("{} matches", self.file.display()));
                    }
                }
                VerifyOutcome::NotFound => {
                    output::error(&format!("{} not found", self.file.display()))
                }
                VerifyOutcome::SizeMismatch { expected, actual } => output::error(&format!(
                    "{} is {} bytes, expected {}",
                    self.file.display(),
                    actual,
                    expected
                )),
                VerifyOutcome::ChecksumMismatch { expected, actual } => {
                    output::error(&format!("{} checksum mismatch", self.file.display()));
                    eprintln!("  expected {}", style(expected).dim());
                    eprintln!("  actual   {}", style(actual).dim());
                }
            }
        }

        if !outcome.is_match() {
            std::process::exit(exit_codes::INTEGRITY_ERROR);
        }
        Ok(())
    }
}
