//! Gantry Signing - signing identities and ephemeral signing sessions
//!
//! Two concerns live here:
//! - [`IdentityResolver`] picks the identity a signing tool should use. The
//!   platform store is unreliable about labels and ordering, so resolution is
//!   an ordered cascade of typed queries with a liveness probe per candidate.
//! - [`SigningSessionManager`] creates a throwaway identity store for one
//!   build, imports the certificate bundles into it, checks they yield the
//!   identities the build needs and guarantees the store is destroyed
//!   afterwards. Each session's store is named after its owner, so
//!   concurrent builds never touch each other's store.
//!
//! Both talk to the platform through the [`IdentitySource`] and
//! [`StoreBackend`] traits. [`SecurityCli`] drives the macOS `security` tool;
//! [`MemoryStore`] is an in-process store for tests.

pub mod backend;
pub mod backends;
pub mod error;
pub mod identity;
pub mod resolver;
pub mod session;

pub use backend::{IdentitySource, StoreBackend};
pub use backends::{MemoryStore, SecurityCli};
pub use error::{Result, SigningError};
pub use identity::{CascadeStep, Identity, IdentityRecord, ListingPolicy};
pub use resolver::{IdentityResolver, ResolveConstraints, StepOutcome, StepResult};
pub use session::{
    bundles_from_config, CertificateBundle, SessionOptions, SessionState, SigningSession,
    SigningSessionManager, UnlockSecret,
};
