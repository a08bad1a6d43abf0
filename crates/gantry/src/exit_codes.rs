//! Exit codes for the CLI
//!
//! Pipeline failures exit with the code of the failing stage; these are the
//! codes the CLI picks itself.

/// Integrity check failed (missing or modified artifact)
pub const INTEGRITY_ERROR: i32 = 5;

/// User cancelled
pub const CANCELLED: i32 = 130;
