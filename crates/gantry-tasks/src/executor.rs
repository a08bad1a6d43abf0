//! Retrying command executor

use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ExecError;
use crate::policy::RetryPolicy;
use crate::runner::{AttemptOutcome, CommandRunner, CommandSpec, ProcessRunner};
use crate::sleeper::{Sleeper, TokioSleeper};

/// Exit code reported for an attempt killed by the per-attempt timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the program could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Diagnostic record for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// Exit code (see [`TIMEOUT_EXIT_CODE`], [`SPAWN_FAILURE_EXIT_CODE`])
    pub exit_code: i32,
    /// Wall-clock time of the attempt
    pub elapsed: Duration,
    /// Short outcome tag: `succeeded`, `failed`, `timed_out`,
    /// `rejected` or `spawn_failed`
    pub outcome: &'static str,
}

/// Final result of a retried command. Produced once per run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Exit code of the last attempt
    pub exit_code: i32,
    /// Number of attempts made
    pub attempts_used: u32,
    /// Time from the first attempt's start to the end of the last one,
    /// including backoff sleeps
    pub total_duration: Duration,
    /// Whether the last attempt succeeded
    pub succeeded: bool,
    /// Whether the last attempt was killed by the timeout
    pub timed_out: bool,
    /// Per-attempt diagnostics
    pub attempts: Vec<AttemptRecord>,
    /// Captured stdout of the last attempt (tail)
    pub stdout: String,
    /// Captured stderr of the last attempt (tail)
    pub stderr: String,
}

impl ExecutionResult {
    /// Short reason for the final failure, for error messages
    pub fn failure_reason(&self) -> String {
        match self.attempts.last().map(|a| a.outcome) {
            Some("timed_out") => "timed out".to_string(),
            Some("rejected") => "output did not match the success pattern".to_string(),
            Some("spawn_failed") => format!("could not start: {}", self.stderr.trim()),
            _ => {
                let stderr = self.stderr.trim();
                if stderr.is_empty() {
                    format!("exit code {}", self.exit_code)
                } else {
                    let last_line = stderr.lines().last().unwrap_or(stderr);
                    format!("exit code {}: {}", self.exit_code, last_line)
                }
            }
        }
    }

    /// Turn exhaustion into an error for callers that treat it as fatal
    pub fn into_result(self, command: &CommandSpec) -> std::result::Result<Self, ExecError> {
        if self.succeeded {
            Ok(self)
        } else {
            Err(ExecError::ExecutionFailed {
                command: command.display(),
                attempts: self.attempts_used,
                exit_code: self.exit_code,
                elapsed_ms: self.total_duration.as_millis() as u64,
                reason: self.failure_reason(),
            })
        }
    }
}

/// Runs commands with a timeout per attempt and exponential backoff between
/// failed attempts. No jitter is applied, so the schedule is deterministic.
#[derive(Clone)]
pub struct RetryingExecutor {
    runner: Arc<dyn CommandRunner>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryingExecutor {
    /// Executor running real processes and sleeping on the tokio timer
    pub fn new() -> Self {
        Self {
            runner: Arc::new(ProcessRunner),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Executor with custom runner and sleeper
    pub fn with_parts(runner: Arc<dyn CommandRunner>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { runner, sleeper }
    }

    /// Run `command` under `policy`.
    ///
    /// Exhausting every attempt is reported through
    /// [`ExecutionResult::succeeded`], never swallowed.
    pub async fn run(&self, command: &CommandSpec, policy: &RetryPolicy) -> ExecutionResult {
        self.run_checked(command, policy, None).await
    }

    /// Like [`run`](Self::run), but a zero exit only counts as success when
    /// stdout matches `success_pattern`.
    pub async fn run_checked(
        &self,
        command: &CommandSpec,
        policy: &RetryPolicy,
        success_pattern: Option<&Regex>,
    ) -> ExecutionResult {
        let shown = command.display();
        let started = Instant::now();
        let mut attempts = Vec::new();
        let mut attempt = 1;

        loop {
            let attempt_started = Instant::now();
            let outcome = self.runner.run(command, policy.per_attempt_timeout()).await;
            let elapsed = attempt_started.elapsed();

            let (exit_code, tag, stdout, stderr) = classify(outcome, success_pattern);
            let succeeded = tag == "succeeded";

            info!(
                command = %shown,
                attempt,
                max_attempts = policy.max_attempts(),
                elapsed_ms = elapsed.as_millis() as u64,
                exit_code,
                outcome = tag,
                "attempt finished"
            );

            attempts.push(AttemptRecord {
                attempt,
                exit_code,
                elapsed,
                outcome: tag,
            });

            // A missing program will not appear between attempts
            let final_attempt = succeeded || attempt >= policy.max_attempts() || tag == "spawn_failed";

            if final_attempt {
                if !succeeded {
                    warn!(
                        command = %shown,
                        attempts = attempt,
                        exit_code,
                        outcome = tag,
                        "command failed, no attempts left"
                    );
                }
                return ExecutionResult {
                    exit_code,
                    attempts_used: attempt,
                    total_duration: started.elapsed(),
                    succeeded,
                    timed_out: tag == "timed_out",
                    attempts,
                    stdout,
                    stderr,
                };
            }

            attempt += 1;
            let delay = policy.delay_before(attempt);
            info!(
                command = %shown,
                next_attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

impl Default for RetryingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RetryingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingExecutor").finish_non_exhaustive()
    }
}

fn classify(
    outcome: AttemptOutcome,
    success_pattern: Option<&Regex>,
) -> (i32, &'static str, String, String) {
    match outcome {
        AttemptOutcome::Exited {
            exit_code: 0,
            stdout,
            stderr,
        } => {
            let accepted = success_pattern.map_or(true, |re| re.is_match(&stdout));
            let tag = if accepted { "succeeded" } else { "rejected" };
            (0, tag, stdout, stderr)
        }
        AttemptOutcome::Exited {
            exit_code,
            stdout,
            stderr,
        } => (exit_code, "failed", stdout, stderr),
        AttemptOutcome::TimedOut { timeout } => (
            TIMEOUT_EXIT_CODE,
            "timed_out",
            String::new(),
            format!("killed after {}ms timeout", timeout.as_millis()),
        ),
        AttemptOutcome::SpawnFailed { error, not_found } => {
            // Treat a program that is merely not executable like any failure
            let tag = if not_found { "spawn_failed" } else { "failed" };
            (SPAWN_FAILURE_EXIT_CODE, tag, String::new(), error)
        }
    }
}
