//! Build command - run the release pipeline

use anyhow::Context;
use clap::Args;
use console::style;
use tracing::{info, warn};

use gantry_pipeline::{BuildOrchestrator, BuildOutcome, OrchestratorConfig, SigningSetup, Stage};
use gantry_signing::{
    bundles_from_config, SessionOptions, SigningSessionManager, StoreBackend, UnlockSecret,
};

use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

use super::security_backend;

/// Run the configured pipeline stages in order
#[derive(Debug, Args)]
pub struct BuildCommand {
    /// Version being built
    #[arg(long, value_name = "VERSION", env = "GANTRY_VERSION")]
    pub build_version: Option<String>,

    /// Build identifier (generated when unset)
    #[arg(long, env = "GANTRY_BUILD_ID")]
    pub build_id: Option<String>,

    /// Team identifier narrowing identity lookups
    #[arg(long, env = "GANTRY_TEAM_ID")]
    pub team_id: Option<String>,

    /// Run without a signing session even if signing is enabled
    #[arg(long)]
    pub no_signing: bool,

    /// Dry run - show the plan without running anything
    #[arg(long)]
    pub dry_run: bool,
}

impl BuildCommand {
    /// Execute the build command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(version = ?self.build_version, build_id = ?self.build_id, dry_run = self.dry_run, "executing build command");
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let (config, root) = cli.load_config()?;
        let version = self
            .build_version
            .clone()
            .context("no version given; pass --build-version or set GANTRY_VERSION")?;

        let stages = Stage::from_config(&config)?;
        if stages.is_empty() {
            anyhow::bail!("no pipeline stages configured");
        }
        let run = OrchestratorConfig::resolve(
            &config,
            &root,
            version,
            self.build_id.clone(),
            self.team_id.clone(),
        )?;
        let signing = config.signing.enabled && !self.no_signing;
        let session_options = SessionOptions::from_config(&config.signing)
            .for_build(&run.build_id)
            .requiring(stages.iter().filter_map(|s| s.identity), run.team_id.clone());

        if cli.is_text() {
            println!();
            println!("{}", output::header("Building release..."));
            println!("{}", output::key_value("Version", &output::version_style().apply_to(&run.version).to_string()));
            println!("{}", output::key_value("Build", &run.build_id));
            println!(
                "{}",
                output::key_value(
                    "Manifest",
                    &output::path_style().apply_to(run.manifest_path.display()).to_string()
                )
            );
            if signing {
                println!(
                    "{}",
                    output::key_value("Keychain", &session_options.store_name(&run.build_id))
                );
            }
            if self.dry_run {
                println!("  {}", style("DRY RUN").yellow().bold());
            }
            println!();
        }

        if self.dry_run {
            return self.print_plan(cli, &stages, &run);
        }

        let backend = security_backend(&config.signing);
        let mut orchestrator =
            BuildOrchestrator::new(stages, run).with_identity_source(backend.clone());

        if signing {
            if !backend.is_available() {
                anyhow::bail!(
                    "{} not found; signing needs the macOS security tool (or pass --no-signing)",
                    config.signing.security_path.display()
                );
            }
            let bundles = bundles_from_config(&config.signing, |name| std::env::var(name).ok())?;
            let secret = match &config.signing.keychain_secret_env {
                Some(var) => UnlockSecret::new(
                    std::env::var(var).with_context(|| format!("{} is not set", var))?,
                ),
                None => UnlockSecret::generate(),
            };
            let manager = SigningSessionManager::new(backend, session_options);
            orchestrator = orchestrator.with_signing(SigningSetup {
                manager,
                bundles,
                secret,
            });
        } else if orchestrator.stages().iter().any(|s| s.identity.is_some()) {
            warn!("running without a signing session, identities resolve from the default keychains");
        }

        // Dropping the run future kills the running tool and deletes the keychain
        let outcome = tokio::select! {
            outcome = orchestrator.run() => Some(outcome),
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(outcome) = outcome else {
            output::error("Interrupted");
            std::process::exit(exit_codes::CANCELLED);
        };

        self.print_outcome(cli, &outcome)?;
        if !outcome.succeeded() {
            std::process::exit(outcome.exit_code());
        }
        Ok(())
    }

    fn print_plan(&self, cli: &Cli, stages: &[Stage], run: &OrchestratorConfig) -> anyhow::Result<()> {
        if cli.format == OutputFormat::Json {
            let plan: Vec<_> = stages
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "name": s.name,
                        "kind": s.kind,
                        "command": s.command,
                        "identity": s.identity,
                        "retry": {
                            "profile": format!("{:?}", s.retry_profile).to_lowercase(),
                            "maxAttempts": s.policy.max_attempts(),
                        },
                        "produces": s.produces.iter().map(|p| &p.path).collect::<Vec<_>>(),
                    })
                })
                .collect();
            return output::json(&serde_json::json!({ "run": run, "stages": plan }));
        }

        if !cli.quiet {
            for (i, stage) in stages.iter().enumerate() {
                println!(
                    "{}. {} ({}) {}",
                    i + 1,
                    style(&stage.name).bold(),
                    stage.kind,
                    style(stage.command.join(" ")).dim()
                );
                if let Some(classification) = stage.identity {
                    println!("{}", output::key_value("identity", &classification.to_string()));
                }
                for produced in &stage.produces {
                    println!("{}", output::key_value("produces", &produced.path));
                }
            }
        }
        Ok(())
    }

    fn print_outcome(&self, cli: &Cli, outcome: &BuildOutcome) -> anyhow::Result<()> {
        let report = &outcome.report;

        if cli.format == OutputFormat::Json {
            return output::json(&serde_json::json!({
                "succeeded": outcome.succeeded(),
                "exitCode": outcome.exit_code(),
                "error": outcome.error.as_ref().map(|e| e.to_string()),
                "report": report,
            }));
        }

        if let Some(error) = &outcome.error {
            output::error(&error.to_string());
        }
        if cli.quiet {
            return Ok(());
        }

        for stage in &report.stages {
            let mark = if stage.succeeded {
                style("✓").green()
            } else {
                style("✗").red()
            };
            let mut line = format!(
                "{} {} ({} attempt(s), {:.1}s)",
                mark,
                stage.name,
                stage.attempts,
                stage.duration_ms as f64 / 1000.0
            );
            if let Some(identity) = &stage.identity {
                line.push_str(&format!(" as {}", output::identity_style().apply_to(identity)));
            }
            println!("{}", line);
        }

        if !report.artifacts.is_empty() {
            println!();
            println!("{}", output::header("Artifacts:"));
            for artifact in &report.artifacts {
                println!(
                    "  {} signed: {} notarized: {}",
                    output::path_style().apply_to(artifact.path.display()),
                    output::flag(artifact.signed),
                    output::flag(artifact.notarized)
                );
            }
        }

        println!();
        if outcome.succeeded() {
            output::success(&format!(
                "Build {} completed in {:.1}s",
                report.build_id,
                report.duration_ms as f64 / 1000.0
            ));
        } else {
            println!(
                "{} Build {} failed (exit code {})",
                style("✗").red().bold(),
                report.build_id,
                outcome.exit_code()
            );
        }
        Ok(())
    }
}
