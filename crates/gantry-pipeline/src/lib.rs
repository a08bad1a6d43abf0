//! Gantry Pipeline - ordered release builds
//!
//! A pipeline is an ordered list of stages (build, sign, package, notarize,
//! staple, publish). The [`BuildOrchestrator`] runs them one after another
//! inside a signing session, retrying each stage's command under the stage's
//! retry profile and recording every produced file in the build manifest.
//! A failed stage aborts the pipeline, but the session is still released and
//! the manifest keeps every record made before the failure.

pub mod error;
pub mod orchestration;
pub mod template;

pub use error::{PipelineError, Result};
pub use orchestration::{
    working_dir, BuildOrchestrator, BuildOutcome, BuildReport, OrchestratorConfig,
    PipelineState, SigningSetup, Stage, StageReport,
};
pub use template::TemplateContext;
