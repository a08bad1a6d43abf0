//! Seams between signing logic and the platform identity store

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::identity::{Identity, IdentityRecord, ListingPolicy};

/// Read access to the identities a store holds
#[async_trait::async_trait]
pub trait IdentitySource: Send + Sync {
    /// List identities in store order.
    ///
    /// `store` narrows the listing to one store; `None` searches the
    /// platform default search list.
    async fn list_identities(
        &self,
        store: Option<&str>,
        policy: ListingPolicy,
    ) -> Result<Vec<IdentityRecord>>;

    /// Perform a no-op operation with the identity to prove its private key
    /// is usable. An error means the identity is not live.
    async fn probe(&self, identity: &Identity) -> Result<()>;
}

/// Lifecycle operations on an ephemeral identity store
#[async_trait::async_trait]
pub trait StoreBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Whether the backend's tooling is present on this host
    fn is_available(&self) -> bool;

    async fn store_exists(&self, store: &str) -> Result<bool>;

    async fn create_store(&self, store: &str, secret: &str) -> Result<()>;

    /// Unlock the store and keep it unlocked for `lock_timeout`
    async fn unlock_store(&self, store: &str, secret: &str, lock_timeout: Duration) -> Result<()>;

    /// Import a PKCS#12 bundle, letting only `tools` use the imported keys
    async fn import_bundle(
        &self,
        store: &str,
        bundle: &Path,
        password: &str,
        tools: &[String],
    ) -> Result<()>;

    /// Let `tools` use the store's keys without interactive prompts
    async fn grant_access(&self, store: &str, secret: &str, tools: &[String]) -> Result<()>;

    async fn delete_store(&self, store: &str) -> Result<()>;

    /// Synchronous delete for teardown from `Drop`
    fn delete_store_blocking(&self, store: &str) -> Result<()>;
}
