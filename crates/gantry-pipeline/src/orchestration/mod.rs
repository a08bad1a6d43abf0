//! Release pipeline orchestration
//!
//! The orchestrator is a sequential state machine:
//! `Idle -> SessionAcquired -> Building(stage)... -> SessionReleased -> Done`,
//! with `Aborted` reachable from any `Building` state. Session release runs
//! on every path out of a run.

mod build;
mod config;
mod stage;

pub use build::{BuildOrchestrator, SigningSetup};
pub use config::{working_dir, OrchestratorConfig};
pub use stage::Stage;

use std::path::PathBuf;

use gantry_artifacts::Artifact;
use gantry_core::StageKind;
use serde::Serialize;

use crate::error::PipelineError;

/// States a pipeline run passes through
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    SessionAcquired,
    Building(String),
    Aborted(String),
    SessionReleased,
    Done,
}

/// Summary of one stage run
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub kind: StageKind,
    pub succeeded: bool,
    pub attempts: u32,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Label of the identity the stage used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// What a run did, successful or not
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build_id: String,
    pub version: String,
    pub manifest_path: PathBuf,
    /// State transitions in order
    pub states: Vec<PipelineState>,
    pub stages: Vec<StageReport>,
    /// Artifacts recorded in the manifest during this run
    pub artifacts: Vec<Artifact>,
    pub duration_ms: u64,
}

impl BuildReport {
    /// Last state reached
    pub fn final_state(&self) -> Option<&PipelineState> {
        self.states.last()
    }

    pub(crate) fn transition(&mut self, state: PipelineState) {
        tracing::debug!(build_id = %self.build_id, state = ?state, "pipeline state");
        self.states.push(state);
    }
}

/// Report plus the error that ended the run, if any
#[derive(Debug)]
pub struct BuildOutcome {
    pub report: BuildReport,
    pub error: Option<PipelineError>,
}

impl BuildOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Get exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, PipelineError::exit_code)
    }

    pub fn into_result(self) -> Result<BuildReport, PipelineError> {
        match self.error {
            None => Ok(self.report),
            Some(e) => Err(e),
        }
    }
}
