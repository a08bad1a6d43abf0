//! Single command attempts

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{ExecError, Result};

/// Captured output is trimmed to its last bytes before it is kept
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// How long to wait for output pipes after the process has exited
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// An external command to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,

    /// Arguments
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,

    /// Working directory
    pub current_dir: Option<PathBuf>,

    /// Values masked when the command line is displayed or logged
    redacted: Vec<String>,
}

impl CommandSpec {
    /// Create a command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
            redacted: Vec::new(),
        }
    }

    /// Build a command from an argv vector
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecError::InvalidCommand("empty command line".to_string()))?;
        if program.trim().is_empty() {
            return Err(ExecError::InvalidCommand("empty program name".to_string()));
        }
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Mask `secret` wherever the command line is shown
    pub fn redact(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.redacted.push(secret);
        }
        self
    }

    /// Command line for logs and error messages
    pub fn display(&self) -> String {
        let mut line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        for secret in &self.redacted {
            line = line.replace(secret.as_str(), "****");
        }
        line
    }
}

/// What happened during one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The process ran to completion
    Exited {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The process outlived the per-attempt timeout and was killed
    TimedOut { timeout: Duration },
    /// The process could not be started
    SpawnFailed { error: String, not_found: bool },
}

/// Runs a single attempt of a command
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> AttemptOutcome;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> AttemptOutcome {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        // Own process group so a timeout can take down the whole tree
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AttemptOutcome::SpawnFailed {
                    not_found: e.kind() == std::io::ErrorKind::NotFound,
                    error: e.to_string(),
                }
            }
        };

        // Dropping this future mid-wait takes the process group down too
        let mut group = ProcessGroupGuard::new(&child);

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                group.disarm();
                let stdout = drain(stdout_task).await;
                let stderr = drain(stderr_task).await;
                debug!(command = %spec.display(), stdout = %stdout, stderr = %stderr, "command output");
                AttemptOutcome::Exited {
                    exit_code: exit_code_of(status),
                    stdout,
                    stderr,
                }
            }
            Ok(Err(e)) => {
                group.disarm();
                stdout_task.abort();
                stderr_task.abort();
                AttemptOutcome::SpawnFailed {
                    error: format!("failed to wait for process: {}", e),
                    not_found: false,
                }
            }
            Err(_) => {
                warn!(command = %spec.display(), timeout_ms = timeout.as_millis() as u64, "attempt timed out, killing process");
                terminate(&mut child).await;
                group.disarm();
                stdout_task.abort();
                stderr_task.abort();
                AttemptOutcome::TimedOut { timeout }
            }
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    tail(&String::from_utf8_lossy(&buf), OUTPUT_TAIL_BYTES)
}

async fn drain(task: tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await {
        Ok(Ok(output)) => output,
        _ => String::new(),
    }
}

/// Kills the child's process group when dropped while armed.
///
/// `kill_on_drop` only reaches the direct child; shell pipelines leave
/// grandchildren behind. Disarm once the child has been reaped, after which
/// the group id may be reused.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!(pgid, "attempt abandoned, killing process group");
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    // SAFETY: signalling a process group we created; no memory is touched.
    unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Kill the child and everything in its process group, then reap it
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_group(pid);
    }

    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill after timeout reported an error");
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Keep the last `max` bytes of `s`, on a char boundary
pub(crate) fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_from_argv() {
        let argv = vec!["codesign".to_string(), "--verify".to_string(), "App.app".to_string()];
        let spec = CommandSpec::from_argv(&argv).unwrap();
        assert_eq!(spec.program, "codesign");
        assert_eq!(spec.args, vec!["--verify", "App.app"]);

        assert!(CommandSpec::from_argv(&[]).is_err());
        assert!(CommandSpec::from_argv(&[" ".to_string()]).is_err());
    }

    #[test]
    fn test_display_redacts_secrets() {
        let spec = CommandSpec::new("security")
            .args(["unlock-keychain", "-p", "hunter2", "build.keychain-db"])
            .redact("hunter2");
        assert_eq!(spec.display(), "security unlock-keychain -p **** build.keychain-db");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        let s = "ééé";
        let t = tail(s, 3);
        assert!(s.ends_with(&t));
        assert_eq!(t, "é");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        let outcome = ProcessRunner
            .run(&sh("echo out; echo err >&2; exit 3"), Duration::from_secs(10))
            .await;

        match outcome {
            AttemptOutcome::Exited {
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stdout.trim(), "out");
                assert_eq!(stderr.trim(), "err");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_and_working_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let spec = sh("printf '%s' \"$GANTRY_TEST_VALUE\" > marker")
            .env("GANTRY_TEST_VALUE", "hello")
            .current_dir(temp.path());

        let outcome = ProcessRunner.run(&spec, Duration::from_secs(10)).await;
        assert!(matches!(outcome, AttemptOutcome::Exited { exit_code: 0, .. }));
        assert_eq!(
            std::fs::read_to_string(temp.path().join("marker")).unwrap(),
            "hello"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let temp = tempfile::TempDir::new().unwrap();
        let marker = temp.path().join("survived");
        let script = format!("sleep 2; touch '{}'", marker.display());

        let started = std::time::Instant::now();
        let outcome = ProcessRunner
            .run(&sh(&script), Duration::from_millis(200))
            .await;

        assert_eq!(
            outcome,
            AttemptOutcome::TimedOut {
                timeout: Duration::from_millis(200)
            }
        );
        assert!(started.elapsed() < Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists(), "timed out command kept running");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_attempt_kills_grandchildren() {
        let temp = tempfile::TempDir::new().unwrap();
        let marker = temp.path().join("survived");
        let script = format!("(sleep 2; touch '{}') & wait", marker.display());

        let spec = sh(&script);
        let cancelled = tokio::time::timeout(
            Duration::from_millis(200),
            ProcessRunner.run(&spec, Duration::from_secs(30)),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists(), "background job outlived the cancelled attempt");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let outcome = ProcessRunner
            .run(
                &CommandSpec::new("gantry-definitely-not-a-real-tool"),
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(
            outcome,
            AttemptOutcome::SpawnFailed { not_found: true, .. }
        ));
    }
}
