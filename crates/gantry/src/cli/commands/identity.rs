//! Identity command - inspect the signing identities a build would use

use clap::{Args, Subcommand};
use console::style;
use tracing::info;

use gantry_core::config::Config;
use gantry_core::Classification;
use gantry_signing::{IdentityResolver, ResolveConstraints};

use crate::cli::{output, Cli, OutputFormat};

use super::security_backend;

/// Signing identity commands
#[derive(Debug, Args)]
pub struct IdentityCommand {
    #[command(subcommand)]
    pub command: IdentitySubcommand,
}

/// Identity subcommands
#[derive(Debug, Subcommand)]
pub enum IdentitySubcommand {
    /// List the identities the store reports
    List(ListCommand),

    /// Resolve the identity a signing tool would be given
    Resolve(ResolveCommand),
}

/// List identities
#[derive(Debug, Args)]
pub struct ListCommand {
    /// Identity class (application, installer, other); selects the listing policy
    #[arg(short, long, default_value = "application")]
    pub classification: Classification,

    /// Keychain to list (defaults to the search list)
    #[arg(long)]
    pub keychain: Option<String>,

    /// Hide expired identities
    #[arg(long)]
    pub valid_only: bool,
}

/// Resolve an identity
#[derive(Debug, Args)]
pub struct ResolveCommand {
    /// Identity class (application, installer, other)
    #[arg(required = true)]
    pub classification: Classification,

    /// Team identifier the identity should belong to
    #[arg(long, env = "GANTRY_TEAM_ID")]
    pub team_id: Option<String>,

    /// Only consider identities whose label contains this text
    #[arg(long)]
    pub label: Option<String>,

    /// Keychain to search (defaults to the search list)
    #[arg(long)]
    pub keychain: Option<String>,
}

impl IdentityCommand {
    /// Execute the identity command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let subcommand_name = match &self.command {
            IdentitySubcommand::List(_) => "list",
            IdentitySubcommand::Resolve(_) => "resolve",
        };
        info!(subcommand = subcommand_name, "executing identity command");
        let rt = tokio::runtime::Runtime::new()?;

        match &self.command {
            IdentitySubcommand::List(cmd) => rt.block_on(cmd.execute(cli)),
            IdentitySubcommand::Resolve(cmd) => rt.block_on(cmd.execute(cli)),
        }
    }
}

fn resolver(config: &Config, keychain: Option<&String>) -> IdentityResolver {
    let backend = security_backend(&config.signing);
    match keychain {
        Some(keychain) => IdentityResolver::for_store(backend, keychain.clone()),
        None => IdentityResolver::new(backend),
    }
}

impl ListCommand {
    async fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let (config, _) = cli.load_config_or_default()?;
        let resolver = resolver(&config, self.keychain.as_ref());
        let mut records = resolver.list(self.classification).await?;
        if self.valid_only {
            records.retain(|r| !r.is_expired());
        }

        if cli.format == OutputFormat::Json {
            return output::json(&records);
        }
        if cli.quiet {
            return Ok(());
        }

        if records.is_empty() {
            output::warning("No identities found");
            return Ok(());
        }

        println!("{}", output::header(&format!("Found {} identities:", records.len())));
        println!();
        for record in &records {
            let expired = if record.is_expired() {
                style(" (expired)").red().to_string()
            } else {
                String::new()
            };
            println!(
                "  {} {}{}",
                style(&record.fingerprint).dim(),
                output::identity_style().apply_to(&record.label),
                expired
            );
            if let Some(not_after) = record.not_after {
                println!("{}", output::key_value("  expires", &not_after.format("%Y-%m-%d").to_string()));
            }
        }
        Ok(())
    }
}

impl ResolveCommand {
    async fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let (config, _) = cli.load_config_or_default()?;
        let resolver = resolver(&config, self.keychain.as_ref());
        let constraints = ResolveConstraints {
            team_id: self.team_id.clone().or_else(|| config.signing.team_id.clone()),
            label_contains: self.label.clone(),
        };

        let identity = resolver.resolve(self.classification, &constraints).await?;

        if cli.format == OutputFormat::Json {
            return output::json(&identity);
        }

        if cli.quiet {
            // Just the reference, for scripts
            println!("{}", identity.tool_reference());
            return Ok(());
        }

        output::success(&format!(
            "Resolved {}",
            output::identity_style().apply_to(&identity.label)
        ));
        println!("{}", output::key_value("Fingerprint", &identity.fingerprint));
        println!("{}", output::key_value("Resolved by", &identity.resolved_by.to_string()));
        println!("{}", output::key_value("Tool reference", identity.tool_reference()));
        if let Some(team) = &identity.team_id {
            println!("{}", output::key_value("Team", team));
        }
        Ok(())
    }
}
