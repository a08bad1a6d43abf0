//! Build orchestration
//!
//! Runs the stages of one release build in order inside a signing session,
//! recording produced artifacts as it goes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use gantry_artifacts::{Artifact, ArtifactManifest};
use gantry_core::config::ProducedArtifactConfig;
use gantry_signing::{
    CertificateBundle, Identity, IdentityResolver, IdentitySource, ResolveConstraints,
    SigningError, SigningSession, SigningSessionManager, UnlockSecret,
};
use gantry_tasks::{CommandSpec, RetryingExecutor};
use tracing::{error, info, instrument, warn};

use crate::error::{PipelineError, Result};
use crate::template::TemplateContext;

use super::config::OrchestratorConfig;
use super::stage::Stage;
use super::{BuildOutcome, BuildReport, PipelineState, StageReport};

/// Everything needed to open the build's signing session
#[derive(Debug)]
pub struct SigningSetup {
    pub manager: SigningSessionManager,
    pub bundles: Vec<CertificateBundle>,
    pub secret: UnlockSecret,
}

/// Runs a release pipeline
pub struct BuildOrchestrator {
    stages: Vec<Stage>,
    config: OrchestratorConfig,
    executor: RetryingExecutor,
    identities: Option<Arc<dyn IdentitySource>>,
    signing: Option<SigningSetup>,
}

impl BuildOrchestrator {
    /// Create an orchestrator running real processes
    pub fn new(stages: Vec<Stage>, config: OrchestratorConfig) -> Self {
        Self {
            stages,
            config,
            executor: RetryingExecutor::new(),
            identities: None,
            signing: None,
        }
    }

    /// Set the executor stage commands run through
    pub fn with_executor(mut self, executor: RetryingExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Set where stage identities are resolved from
    pub fn with_identity_source(mut self, source: Arc<dyn IdentitySource>) -> Self {
        self.identities = Some(source);
        self
    }

    /// Run the stages inside a signing session
    pub fn with_signing(mut self, signing: SigningSetup) -> Self {
        self.signing = Some(signing);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run the pipeline.
    ///
    /// The returned outcome always carries a report; the manifest on disk
    /// holds every artifact recorded before a failure.
    #[instrument(skip(self), fields(build_id = %self.config.build_id, version = %self.config.version, stages = self.stages.len()))]
    pub async fn run(&self) -> BuildOutcome {
        let start = Instant::now();
        let mut report = BuildReport {
            build_id: self.config.build_id.clone(),
            version: self.config.version.clone(),
            manifest_path: self.config.manifest_path.clone(),
            states: Vec::new(),
            stages: Vec::new(),
            artifacts: Vec::new(),
            duration_ms: 0,
        };
        report.transition(PipelineState::Idle);

        let error = self.run_inner(&mut report).await.err();
        report.duration_ms = start.elapsed().as_millis() as u64;

        match &error {
            None => info!(
                artifact_count = report.artifacts.len(),
                duration_ms = report.duration_ms,
                "build completed"
            ),
            Some(e) => error!(
                stage = e.stage().unwrap_or("-"),
                exit_code = e.exit_code(),
                error = %e,
                "build failed"
            ),
        }

        BuildOutcome { report, error }
    }

    async fn run_inner(&self, report: &mut BuildReport) -> Result<()> {
        let mut manifest = ArtifactManifest::create(
            &self.config.manifest_path,
            &self.config.build_id,
            &self.config.version,
        )
        .map_err(PipelineError::Manifest)?;

        let mut session = match &self.signing {
            Some(signing) => {
                let session = signing
                    .manager
                    .acquire(&signing.bundles, signing.secret.clone())
                    .await
                    .map_err(PipelineError::Session)?;
                report.transition(PipelineState::SessionAcquired);
                Some(session)
            }
            None => None,
        };

        let result = self
            .run_stages(&mut manifest, session.as_ref(), report)
            .await;

        if let Some(session) = session.as_mut() {
            match session.release().await {
                Ok(()) => report.transition(PipelineState::SessionReleased),
                Err(e) => {
                    // Dropping the session retries the delete synchronously
                    error!(keychain = %session.store(), error = %e, "failed to release signing session");
                    if result.is_ok() {
                        return Err(PipelineError::Session(e));
                    }
                }
            }
        }

        result?;
        report.transition(PipelineState::Done);
        Ok(())
    }

    async fn run_stages(
        &self,
        manifest: &mut ArtifactManifest,
        session: Option<&SigningSession>,
        report: &mut BuildReport,
    ) -> Result<()> {
        let resolver = self.identities.as_ref().map(|source| match session {
            Some(session) => IdentityResolver::for_store(Arc::clone(source), session.store()),
            None => IdentityResolver::new(Arc::clone(source)),
        });

        for stage in &self.stages {
            report.transition(PipelineState::Building(stage.name.clone()));
            if let Err(e) = self
                .run_stage(stage, manifest, resolver.as_ref(), session, report)
                .await
            {
                report.transition(PipelineState::Aborted(stage.name.clone()));
                return Err(e);
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(stage = %stage.name, kind = %stage.kind))]
    async fn run_stage(
        &self,
        stage: &Stage,
        manifest: &mut ArtifactManifest,
        resolver: Option<&IdentityResolver>,
        session: Option<&SigningSession>,
        report: &mut BuildReport,
    ) -> Result<()> {
        let identity = match stage.identity {
            Some(classification) => {
                let resolver = resolver.ok_or_else(|| PipelineError::Identity {
                    stage: stage.name.clone(),
                    source: SigningError::Configuration(
                        "stage needs a signing identity but no identity source is set".to_string(),
                    ),
                })?;
                let constraints = ResolveConstraints {
                    team_id: self.config.team_id.clone(),
                    label_contains: None,
                };
                let identity = resolver
                    .resolve(classification, &constraints)
                    .await
                    .map_err(|source| PipelineError::Identity {
                        stage: stage.name.clone(),
                        source,
                    })?;
                Some(identity)
            }
            None => None,
        };

        let context = TemplateContext {
            version: self.config.version.clone(),
            build_id: self.config.build_id.clone(),
            identity: identity.as_ref().map(|i| i.tool_reference().to_string()),
            keychain: session.map(|s| s.store().to_string()),
            workdir: self.config.working_dir.clone(),
        };
        let command = self.command_for(stage, &context)?;

        info!(command = %command.display(), policy = ?stage.retry_profile, "running stage");
        let result = self
            .executor
            .run_checked(&command, &stage.policy, stage.success_pattern.as_ref())
            .await;

        report.stages.push(StageReport {
            name: stage.name.clone(),
            kind: stage.kind,
            succeeded: result.succeeded,
            attempts: result.attempts_used,
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            duration_ms: result.total_duration.as_millis() as u64,
            identity: identity.as_ref().map(|i| i.label.clone()),
        });

        if !result.succeeded {
            return Err(PipelineError::StageFailed {
                stage: stage.name.clone(),
                kind: stage.kind,
                attempts: result.attempts_used,
                exit_code: result.exit_code,
                reason: result.failure_reason(),
            });
        }

        for produced in &stage.produces {
            let artifact = self
                .record(stage, produced, &context, identity.as_ref())
                .await?;
            manifest
                .append(artifact.clone())
                .map_err(|source| PipelineError::Artifact {
                    stage: stage.name.clone(),
                    source,
                })?;
            report.artifacts.push(artifact);
        }

        Ok(())
    }

    fn command_for(&self, stage: &Stage, context: &TemplateContext) -> Result<CommandSpec> {
        let template_error = |message: String| PipelineError::Template {
            stage: stage.name.clone(),
            message,
        };

        let argv = stage
            .command
            .iter()
            .map(|arg| context.expand(arg))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(template_error)?;
        let mut command = CommandSpec::from_argv(&argv)
            .map_err(|e| template_error(e.to_string()))?
            .current_dir(&self.config.working_dir);

        for (key, value) in &stage.env {
            let value = context.expand(value).map_err(template_error)?;
            command = command.env(key.clone(), value);
        }
        Ok(command)
    }

    /// Fingerprint a produced file off the async runtime
    async fn record(
        &self,
        stage: &Stage,
        produced: &ProducedArtifactConfig,
        context: &TemplateContext,
        identity: Option<&Identity>,
    ) -> Result<Artifact> {
        let path = PathBuf::from(context.expand(&produced.path).map_err(|message| {
            PipelineError::Template {
                stage: stage.name.clone(),
                message,
            }
        })?);

        let root = self.config.working_dir.clone();
        let artifact = tokio::task::spawn_blocking(move || Artifact::from_file(&root, path))
            .await
            .map_err(|e| PipelineError::Internal(e.to_string()))?
            .map_err(|source| {
                warn!(stage = %stage.name, error = %source, "expected artifact missing");
                PipelineError::Artifact {
                    stage: stage.name.clone(),
                    source,
                }
            })?;

        let mut artifact = artifact
            .with_signed(produced.signed.unwrap_or_else(|| stage.signs()))
            .with_notarized(
                produced
                    .notarized
                    .unwrap_or_else(|| stage.kind.produces_notarized()),
            )
            .with_stage(stage.name.clone());
        if let Some(name) = &produced.name {
            artifact = artifact.with_name(name.clone());
        }
        if let Some(kind) = produced.kind {
            artifact = artifact.with_kind(kind);
        }
        if let Some(identity) = identity {
            artifact = artifact.with_signing_identity(identity.label.clone());
        }
        Ok(artifact)
    }
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("stages", &self.stages.len())
            .field("config", &self.config)
            .field("signing", &self.signing.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use gantry_artifacts::ArtifactStatus;
    use gantry_core::config::parse_config;
    use gantry_signing::{IdentityRecord, MemoryStore, SessionOptions};
    use gantry_tasks::{ProcessRunner, RecordingSleeper};
    use std::time::Duration;
    use tempfile::TempDir;

    const STORE: &str = "gantry-pipeline-test-build.keychain-db";

    const PIPELINE: &str = r#"
[retry.local]
max_attempts = 2
initial_delay_ms = 10
backoff_multiplier = 2.0
per_attempt_timeout_secs = 30

[retry.network]
max_attempts = 3
initial_delay_ms = 20
backoff_multiplier = 2.0
per_attempt_timeout_secs = 30

[[pipeline.stages]]
name = "build"
kind = "build"
command = ["sh", "-c", "mkdir -p dist && printf '0123456789' > dist/App.app.zip"]
produces = [{ path = "dist/App.app.zip" }]

[[pipeline.stages]]
name = "sign-app"
kind = "sign"
identity = "application"
command = ["sh", "-c", "printf '%s|%s' \"$SIGN_AS\" {keychain} > dist/signed-by.txt"]
env = { SIGN_AS = "{identity}" }

[[pipeline.stages]]
name = "package"
kind = "package"
identity = "installer"
command = ["sh", "-c", "printf '01234567890123456789' > dist/App-{version}.pkg"]
produces = [{ path = "dist/App-{version}.pkg" }]
"#;

    const BUNDLE: &[u8] = b"pkcs12-developer-id";

    struct Harness {
        temp: TempDir,
        store: Arc<MemoryStore>,
        sleeper: RecordingSleeper,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            store.register_bundle(
                BUNDLE.to_vec(),
                IdentityRecord::new(
                    "1111111111111111111111111111111111111111",
                    "Developer ID Application: X (ABC123)",
                ),
                true,
            );
            store.register_bundle(
                BUNDLE.to_vec(),
                IdentityRecord::new(
                    "2222222222222222222222222222222222222222",
                    "Developer ID Installer: X (ABC123)",
                ),
                false,
            );
            // Identities outside the session store must never be picked
            store.add_identity(
                IdentityRecord::new(
                    "9999999999999999999999999999999999999999",
                    "Developer ID Application: Someone Else (ZZZ999)",
                ),
                true,
            );
            Self {
                temp: TempDir::new().unwrap(),
                store,
                sleeper: RecordingSleeper::new(),
            }
        }

        fn orchestrator(&self, toml: &str) -> BuildOrchestrator {
            let config = parse_config(toml, true).unwrap();
            let stages = Stage::from_config(&config).unwrap();
            let run = OrchestratorConfig::resolve(
                &config,
                self.temp.path(),
                "1.0.0",
                Some("test-build".to_string()),
                Some("ABC123".to_string()),
            )
            .unwrap();

            let manager = SigningSessionManager::new(
                self.store.clone(),
                SessionOptions {
                    store: "gantry-pipeline.keychain-db".to_string(),
                    grant_tools: vec!["/usr/bin/codesign".to_string()],
                    lock_timeout: Duration::from_secs(600),
                    ..Default::default()
                }
                .for_build(&run.build_id),
            );
            let bundle = self.temp.path().join("developer-id.p12");
            std::fs::write(&bundle, BUNDLE).unwrap();

            BuildOrchestrator::new(stages, run)
                .with_executor(RetryingExecutor::with_parts(
                    Arc::new(ProcessRunner),
                    Arc::new(self.sleeper.clone()),
                ))
                .with_identity_source(self.store.clone())
                .with_signing(SigningSetup {
                    manager,
                    bundles: vec![CertificateBundle::from_file(bundle, "pw")],
                    secret: UnlockSecret::generate(),
                })
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.temp.path().join(rel)
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let harness = Harness::new();
        let outcome = harness.orchestrator(PIPELINE).run().await;

        assert!(outcome.succeeded(), "{:?}", outcome.error);
        assert_eq!(outcome.exit_code(), 0);
        let report = &outcome.report;
        assert_eq!(
            report.states,
            vec![
                PipelineState::Idle,
                PipelineState::SessionAcquired,
                PipelineState::Building("build".to_string()),
                PipelineState::Building("sign-app".to_string()),
                PipelineState::Building("package".to_string()),
                PipelineState::SessionReleased,
                PipelineState::Done,
            ]
        );

        // Identity and keychain reached the command
        assert_eq!(
            std::fs::read_to_string(harness.path("dist/signed-by.txt")).unwrap(),
            format!("Developer ID Application: X (ABC123)|{}", STORE)
        );
        assert_eq!(
            report.stages[2].identity.as_deref(),
            Some("Developer ID Installer: X (ABC123)")
        );

        let sizes: Vec<u64> = report.artifacts.iter().map(|a| a.size).collect();
        assert_eq!(sizes, vec![10, 20]);
        assert!(!report.artifacts[0].signed);
        assert!(report.artifacts[1].signed);
        assert_eq!(report.artifacts[1].stage.as_deref(), Some("package"));

        let manifest = ArtifactManifest::open(harness.path("artifacts/manifest-test-build.json"))
            .unwrap();
        assert_eq!(manifest.artifacts().len(), 2);
        assert!(manifest.validate(harness.temp.path()).is_valid());

        assert!(!harness.store.has_store(STORE));
        assert!(harness.sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_stage_failure_releases_session_and_keeps_manifest() {
        let harness = Harness::new();
        let failing = PIPELINE.replace(
            "printf '01234567890123456789' > dist/App-{version}.pkg",
            "echo 'productbuild: no such component' >&2; exit 9",
        );

        let outcome = harness.orchestrator(&failing).run().await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.exit_code(), 1);
        match outcome.error.as_ref().unwrap() {
            PipelineError::StageFailed {
                stage,
                attempts,
                exit_code,
                reason,
                ..
            } => {
                assert_eq!(stage, "package");
                assert_eq!(*attempts, 2);
                assert_eq!(*exit_code, 9);
                assert!(reason.contains("no such component"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(harness.sleeper.recorded(), vec![Duration::from_millis(10)]);

        let states = &outcome.report.states;
        assert!(states.contains(&PipelineState::Aborted("package".to_string())));
        assert_eq!(states.last(), Some(&PipelineState::SessionReleased));

        // The store is gone and the first stage's record survived
        assert!(!harness.store.has_store(STORE));
        let manifest = ArtifactManifest::open(harness.path("artifacts/manifest-test-build.json"))
            .unwrap();
        assert_eq!(manifest.artifacts().len(), 1);
        let report = manifest.validate(harness.temp.path());
        assert_eq!(report.entries[0].status, ArtifactStatus::Match);
    }

    #[tokio::test]
    async fn test_missing_artifact_aborts() {
        let harness = Harness::new();
        let broken = PIPELINE.replace(
            "produces = [{ path = \"dist/App.app.zip\" }]",
            "produces = [{ path = \"dist/Other.app.zip\" }]",
        );

        let outcome = harness.orchestrator(&broken).run().await;
        assert_eq!(outcome.exit_code(), 5);
        assert!(matches!(
            outcome.error,
            Some(PipelineError::Artifact { ref stage, .. }) if stage == "build"
        ));
        assert!(!harness.store.has_store(STORE));
    }

    #[tokio::test]
    async fn test_unresolvable_identity_aborts() {
        let harness = Harness::new();
        harness.store.fail_probe("2222222222222222222222222222222222222222");

        let outcome = harness.orchestrator(PIPELINE).run().await;
        assert_eq!(outcome.exit_code(), 2);
        let message = outcome.error.as_ref().unwrap().to_string();
        assert!(message.contains("Stage 'package'"));
        assert!(message.contains("Developer ID Installer: X (ABC123)"));
        assert!(!harness.store.has_store(STORE));
    }

    #[tokio::test]
    async fn test_session_failure_runs_no_stages() {
        let harness = Harness::new();
        harness.store.fail_on("unlock");

        let outcome = harness.orchestrator(PIPELINE).run().await;
        assert_eq!(outcome.exit_code(), 6);
        assert_eq!(outcome.report.states, vec![PipelineState::Idle]);
        assert!(outcome.report.stages.is_empty());
        assert!(!harness.path("dist").exists());
        assert!(!harness.store.has_store(STORE));
    }

    #[tokio::test]
    async fn test_rejected_notarization_output() {
        let harness = Harness::new();
        let notarize = format!(
            "{}\n{}",
            PIPELINE,
            r#"
[[pipeline.stages]]
name = "notarize"
kind = "notarize"
command = ["sh", "-c", "echo 'status: Invalid'"]
success_pattern = "status: Accepted"
"#
        );

        let outcome = harness.orchestrator(&notarize).run().await;
        assert_eq!(outcome.exit_code(), 3);
        // Network profile: three attempts, two backoff sleeps
        assert_eq!(
            harness.sleeper.recorded(),
            vec![Duration::from_millis(20), Duration::from_millis(40)]
        );
        assert_eq!(outcome.report.stages.last().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_existing_manifest_is_not_overwritten() {
        let harness = Harness::new();
        std::fs::create_dir_all(harness.path("artifacts")).unwrap();
        std::fs::write(harness.path("artifacts/manifest-test-build.json"), "{}").unwrap();

        let outcome = harness.orchestrator(PIPELINE).run().await;
        assert_eq!(outcome.exit_code(), 5);
        assert!(outcome.report.stages.is_empty());
        assert_eq!(
            std::fs::read_to_string(harness.path("artifacts/manifest-test-build.json")).unwrap(),
            "{}"
        );
    }
}
