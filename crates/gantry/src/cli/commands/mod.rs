//! CLI commands

mod build;
mod checksum;
mod identity;
mod manifest;

pub use build::BuildCommand;
pub use checksum::ChecksumCommand;
pub use identity::IdentityCommand;
pub use manifest::ManifestCommand;

use std::sync::Arc;

use gantry_core::config::SigningConfig;
use gantry_signing::SecurityCli;

/// The platform identity store, as configured
fn security_backend(config: &SigningConfig) -> Arc<SecurityCli> {
    Arc::new(SecurityCli::new().with_security_path(&config.security_path))
}
