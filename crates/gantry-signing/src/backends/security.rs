//! macOS identity store backend driving the `security` tool

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gantry_tasks::{AttemptOutcome, CommandRunner, CommandSpec, ProcessRunner};
use gantry_core::Classification;
use tracing::{debug, info};

use crate::backend::{IdentitySource, StoreBackend};
use crate::error::{Result, SigningError};
use crate::identity::{Identity, IdentityRecord, ListingPolicy};

/// Store operations should finish quickly; a hang means a GUI prompt
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Keychain backend using `/usr/bin/security` and `/usr/bin/codesign`
#[derive(Clone)]
pub struct SecurityCli {
    /// Path to security binary (for keychain operations)
    security_path: PathBuf,
    /// Path to codesign binary (for the liveness probe)
    codesign_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl SecurityCli {
    /// Create a backend using the system tools
    pub fn new() -> Self {
        Self {
            security_path: PathBuf::from("/usr/bin/security"),
            codesign_path: PathBuf::from("/usr/bin/codesign"),
            runner: Arc::new(ProcessRunner),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_security_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.security_path = path.into();
        self
    }

    pub fn with_codesign_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.codesign_path = path.into();
        self
    }

    /// Run tool invocations through `runner`
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `security` and return its stdout
    async fn security(&self, args: &[&str], secrets: &[&str]) -> Result<String> {
        let mut spec = CommandSpec::new(self.security_path.display().to_string()).args(args.iter().copied());
        for secret in secrets {
            spec = spec.redact(*secret);
        }
        self.run_tool("security", &spec).await
    }

    async fn run_tool(&self, tool: &str, spec: &CommandSpec) -> Result<String> {
        debug!(command = %spec.display(), "running {}", tool);

        match self.runner.run(spec, self.timeout).await {
            AttemptOutcome::Exited {
                exit_code: 0,
                stdout,
                ..
            } => Ok(stdout),
            AttemptOutcome::Exited {
                exit_code,
                stdout,
                stderr,
            } => {
                let output = if stderr.trim().is_empty() { stdout } else { stderr };
                Err(SigningError::ToolFailed {
                    tool: tool.to_string(),
                    reason: format!(
                        "'{}' exited with {}: {}",
                        spec.display(),
                        exit_code,
                        output.trim()
                    ),
                })
            }
            AttemptOutcome::TimedOut { timeout } => Err(SigningError::ToolFailed {
                tool: tool.to_string(),
                reason: format!("'{}' timed out after {}s", spec.display(), timeout.as_secs()),
            }),
            AttemptOutcome::SpawnFailed {
                not_found: true, ..
            } => Err(SigningError::ToolNotFound {
                tool: spec.program.clone(),
                hint: "Install the Xcode command line tools (xcode-select --install)".to_string(),
            }),
            AttemptOutcome::SpawnFailed { error, .. } => Err(SigningError::ToolFailed {
                tool: tool.to_string(),
                reason: error,
            }),
        }
    }
}

impl Default for SecurityCli {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecurityCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityCli")
            .field("security_path", &self.security_path)
            .field("codesign_path", &self.codesign_path)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Key partitions granting `tools` access without prompts.
///
/// System tools share the `apple-tool:` partition; anything else relies on
/// the per-import application list.
fn partitions_for(tools: &[String]) -> Option<String> {
    let system_tool = |t: &String| t.starts_with("/usr/bin/") || t.starts_with("/usr/sbin/");
    if tools.iter().any(system_tool) {
        Some("apple-tool:".to_string())
    } else {
        None
    }
}

#[async_trait::async_trait]
impl IdentitySource for SecurityCli {
    async fn list_identities(
        &self,
        store: Option<&str>,
        policy: ListingPolicy,
    ) -> Result<Vec<IdentityRecord>> {
        let mut args = vec!["find-identity", "-v", "-p", policy.as_str()];
        if let Some(store) = store {
            args.push(store);
        }

        let stdout = self
            .security(&args, &[])
            .await
            .map_err(|e| SigningError::KeychainError(e.to_string()))?;

        Ok(stdout
            .lines()
            .filter_map(IdentityRecord::parse_listing_line)
            .collect())
    }

    async fn probe(&self, identity: &Identity) -> Result<()> {
        match identity.classification {
            Classification::ApplicationSigning => {
                // Signing a throwaway file proves the private key is usable
                let scratch = tempfile::Builder::new()
                    .prefix("gantry-probe-")
                    .tempfile()?;
                std::io::Write::write_all(&mut scratch.as_file(), b"gantry identity probe\n")?;

                let mut spec = CommandSpec::new(self.codesign_path.display().to_string())
                    .args(["--force", "--sign", identity.fingerprint.as_str()]);
                if let Some(keychain) = &identity.keychain {
                    spec = spec.arg("--keychain").arg(keychain.as_str());
                }
                spec = spec.arg(scratch.path().display().to_string());

                self.run_tool("codesign", &spec).await.map(|_| ())
            }
            Classification::InstallerSigning | Classification::Other => {
                let mut args = vec!["find-certificate", "-c", identity.label.as_str()];
                if let Some(keychain) = &identity.keychain {
                    args.push(keychain.as_str());
                }
                self.security(&args, &[]).await.map(|_| ())
            }
        }
    }
}

#[async_trait::async_trait]
impl StoreBackend for SecurityCli {
    fn name(&self) -> &str {
        "security"
    }

    fn is_available(&self) -> bool {
        self.security_path.exists() || which::which(&self.security_path).is_ok()
    }

    async fn store_exists(&self, store: &str) -> Result<bool> {
        let stdout = self.security(&["list-keychains", "-d", "user"], &[]).await?;
        if stdout.lines().any(|l| l.trim().trim_matches('"').ends_with(store)) {
            return Ok(true);
        }
        // Keychains are not necessarily on the search list
        match self.security(&["show-keychain-info", store], &[]).await {
            Ok(_) => Ok(true),
            Err(SigningError::ToolFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_store(&self, store: &str, secret: &str) -> Result<()> {
        self.security(&["create-keychain", "-p", secret, store], &[secret])
            .await?;
        info!(keychain = %store, "created keychain");
        Ok(())
    }

    async fn unlock_store(&self, store: &str, secret: &str, lock_timeout: Duration) -> Result<()> {
        self.security(&["unlock-keychain", "-p", secret, store], &[secret])
            .await?;
        let timeout = lock_timeout.as_secs().to_string();
        self.security(&["set-keychain-settings", "-lut", &timeout, store], &[])
            .await?;
        Ok(())
    }

    async fn import_bundle(
        &self,
        store: &str,
        bundle: &Path,
        password: &str,
        tools: &[String],
    ) -> Result<()> {
        let bundle = bundle.display().to_string();
        let mut args = vec![
            "import",
            bundle.as_str(),
            "-k",
            store,
            "-f",
            "pkcs12",
            "-P",
            password,
        ];
        for tool in tools {
            args.push("-T");
            args.push(tool.as_str());
        }
        self.security(&args, &[password]).await?;
        Ok(())
    }

    async fn grant_access(&self, store: &str, secret: &str, tools: &[String]) -> Result<()> {
        let Some(partitions) = partitions_for(tools) else {
            debug!(keychain = %store, "no system tools to grant partition access to");
            return Ok(());
        };
        self.security(
            &[
                "set-key-partition-list",
                "-S",
                &partitions,
                "-s",
                "-k",
                secret,
                store,
            ],
            &[secret],
        )
        .await?;
        info!(keychain = %store, tools = ?tools, "granted signing tools access");
        Ok(())
    }

    async fn delete_store(&self, store: &str) -> Result<()> {
        self.security(&["delete-keychain", store], &[]).await?;
        info!(keychain = %store, "deleted keychain");
        Ok(())
    }

    fn delete_store_blocking(&self, store: &str) -> Result<()> {
        let output = std::process::Command::new(&self.security_path)
            .args(["delete-keychain", store])
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SigningError::KeychainError(format!(
                "delete-keychain {} failed: {}",
                store,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records command lines and answers from a fixed table
    #[derive(Default)]
    struct FakeRunner {
        calls: Mutex<Vec<CommandSpec>>,
        responses: Vec<(&'static str, AttemptOutcome)>,
    }

    impl FakeRunner {
        fn respond(mut self, args_prefix: &'static str, outcome: AttemptOutcome) -> Self {
            self.responses.push((args_prefix, outcome));
            self
        }

        fn lines(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.display())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, spec: &CommandSpec, _timeout: Duration) -> AttemptOutcome {
            self.calls.lock().unwrap().push(spec.clone());
            let args = spec.args.join(" ");
            self.responses
                .iter()
                .find(|(prefix, _)| args.starts_with(prefix))
                .map(|(_, outcome)| outcome.clone())
                .unwrap_or(AttemptOutcome::Exited {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
        }
    }

    fn ok(stdout: &str) -> AttemptOutcome {
        AttemptOutcome::Exited {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn fail(code: i32, stderr: &str) -> AttemptOutcome {
        AttemptOutcome::Exited {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn cli(runner: &Arc<FakeRunner>) -> SecurityCli {
        SecurityCli::new().with_runner(runner.clone())
    }

    const LISTING: &str = r#"
Policy: Basic X.509
  Matching identities
  1) 1111111111111111111111111111111111111111 "Developer ID Application: X (ABC123)"
  2) 2222222222222222222222222222222222222222 "Developer ID Installer: X (ABC123)"
     2 valid identities found
"#;

    #[tokio::test]
    async fn test_list_identities_parses_listing() {
        let runner = Arc::new(FakeRunner::default().respond("find-identity", ok(LISTING)));

        let records = cli(&runner)
            .list_identities(Some("build.keychain-db"), ListingPolicy::Basic)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].label, "Developer ID Installer: X (ABC123)");
        assert_eq!(
            runner.lines(),
            vec!["/usr/bin/security find-identity -v -p basic build.keychain-db"]
        );
    }

    #[tokio::test]
    async fn test_list_failure_is_keychain_error() {
        let runner = Arc::new(
            FakeRunner::default().respond("find-identity", fail(50, "keychain not found")),
        );
        let err = cli(&runner)
            .list_identities(None, ListingPolicy::CodeSigning)
            .await
            .unwrap_err();
        assert!(matches!(err, SigningError::KeychainError(_)));
        assert!(err.to_string().contains("keychain not found"));
    }

    #[tokio::test]
    async fn test_session_commands_redact_secrets() {
        let runner = Arc::new(FakeRunner::default());
        let cli = cli(&runner);
        let tools = vec![
            "/usr/bin/codesign".to_string(),
            "/usr/bin/productsign".to_string(),
        ];

        cli.create_store("g.keychain-db", "s3cret").await.unwrap();
        cli.unlock_store("g.keychain-db", "s3cret", Duration::from_secs(21600))
            .await
            .unwrap();
        cli.import_bundle("g.keychain-db", Path::new("/tmp/app.p12"), "pw!", &tools)
            .await
            .unwrap();
        cli.grant_access("g.keychain-db", "s3cret", &tools)
            .await
            .unwrap();
        cli.delete_store("g.keychain-db").await.unwrap();

        assert_eq!(
            runner.lines(),
            vec![
                "/usr/bin/security create-keychain -p **** g.keychain-db",
                "/usr/bin/security unlock-keychain -p **** g.keychain-db",
                "/usr/bin/security set-keychain-settings -lut 21600 g.keychain-db",
                "/usr/bin/security import /tmp/app.p12 -k g.keychain-db -f pkcs12 -P **** -T /usr/bin/codesign -T /usr/bin/productsign",
                "/usr/bin/security set-key-partition-list -S apple-tool: -s -k **** g.keychain-db",
                "/usr/bin/security delete-keychain g.keychain-db",
            ]
        );

        // The real values still reach the tool
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].args[2], "s3cret");
    }

    #[tokio::test]
    async fn test_import_failure_surfaces_stderr() {
        let runner = Arc::new(FakeRunner::default().respond(
            "import",
            fail(1, "security: SecKeychainItemImport: MAC verification failed"),
        ));
        let err = cli(&runner)
            .import_bundle("g", Path::new("a.p12"), "wrong", &[])
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("MAC verification failed"));
        assert!(!message.contains("wrong"));
    }

    #[tokio::test]
    async fn test_probe_by_classification() {
        let runner = Arc::new(FakeRunner::default());
        let cli = cli(&runner);
        let record = IdentityRecord::new(
            "1111111111111111111111111111111111111111",
            "Developer ID Installer: X (ABC123)",
        );

        let installer = Identity::from_record(
            &record,
            Classification::InstallerSigning,
            crate::CascadeStep::Canonical,
            Some("g.keychain-db"),
        );
        cli.probe(&installer).await.unwrap();

        let app = Identity::from_record(
            &record,
            Classification::ApplicationSigning,
            crate::CascadeStep::Canonical,
            None,
        );
        cli.probe(&app).await.unwrap();

        let lines = runner.lines();
        assert_eq!(
            lines[0],
            "/usr/bin/security find-certificate -c Developer ID Installer: X (ABC123) g.keychain-db"
        );
        assert!(lines[1].starts_with(
            "/usr/bin/codesign --force --sign 1111111111111111111111111111111111111111 "
        ));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let runner = Arc::new(FakeRunner::default().respond(
            "delete-keychain",
            AttemptOutcome::SpawnFailed {
                error: "No such file or directory".to_string(),
                not_found: true,
            },
        ));
        let err = cli(&runner).delete_store("g").await.unwrap_err();
        assert!(matches!(err, SigningError::ToolNotFound { .. }));
    }

    #[test]
    fn test_partitions_for() {
        assert_eq!(
            partitions_for(&["/usr/bin/codesign".to_string()]).as_deref(),
            Some("apple-tool:")
        );
        assert_eq!(partitions_for(&["/opt/signer".to_string()]), None);
    }
}
