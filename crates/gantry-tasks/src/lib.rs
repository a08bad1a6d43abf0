//! Gantry Tasks - resilient execution of external commands
//!
//! Build, signing and notarization tools fail transiently. This crate runs
//! them under a per-attempt timeout and retries failures with deterministic
//! exponential backoff:
//! - [`RetryPolicy`]: validated, immutable retry configuration
//! - [`CommandRunner`]: a single attempt, [`ProcessRunner`] for real processes
//! - [`Sleeper`]: the backoff suspension point, injectable for tests
//! - [`RetryingExecutor`]: the retry loop, producing an [`ExecutionResult`]

pub mod error;
pub mod executor;
pub mod policy;
pub mod runner;
pub mod sleeper;

pub use error::{ExecError, Result};
pub use executor::{
    AttemptRecord, ExecutionResult, RetryingExecutor, SPAWN_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
pub use policy::RetryPolicy;
pub use runner::{AttemptOutcome, CommandRunner, CommandSpec, ProcessRunner};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
