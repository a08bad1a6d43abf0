//! In-process identity store
//!
//! Behaves like a keychain without touching the host. Each store holds the
//! identities imported into it; identities added without a store make up
//! the default search list. Every operation is logged so callers can assert
//! on what a session did, and individual operations can be made to fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{IdentitySource, StoreBackend};
use crate::error::{Result, SigningError};
use crate::identity::{Identity, IdentityRecord, ListingPolicy};

/// (record, valid for code signing)
type Entry = (IdentityRecord, bool);

#[derive(Debug, Default)]
struct State {
    search_list: Vec<Entry>,
    stores: BTreeMap<String, Vec<Entry>>,
    /// Identities a bundle yields on import, keyed by bundle contents
    bundles: HashMap<Vec<u8>, Vec<Entry>>,
    dead: HashSet<String>,
    failing: HashSet<&'static str>,
    bundle_password: Option<String>,
    events: Vec<String>,
    probes: Vec<String>,
}

/// Identity store kept in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity at the end of the default search list
    pub fn add_identity(&self, record: IdentityRecord, code_signing: bool) {
        self.with_state(|s| s.search_list.push((record, code_signing)));
    }

    /// Add an identity to `store`, creating the store if needed
    pub fn add_identity_to(&self, store: &str, record: IdentityRecord, code_signing: bool) {
        self.with_state(|s| {
            s.stores
                .entry(store.to_string())
                .or_default()
                .push((record, code_signing))
        });
    }

    /// Importing a bundle file with `contents` adds `record` to the store
    pub fn register_bundle(
        &self,
        contents: impl Into<Vec<u8>>,
        record: IdentityRecord,
        code_signing: bool,
    ) {
        let contents = contents.into();
        self.with_state(|s| {
            s.bundles
                .entry(contents)
                .or_default()
                .push((record, code_signing))
        });
    }

    /// Make the liveness probe fail for `fingerprint`
    pub fn fail_probe(&self, fingerprint: &str) {
        self.with_state(|s| {
            s.dead.insert(fingerprint.to_string());
        });
    }

    /// Make `operation` fail (`create`, `unlock`, `import`, `grant`, `delete`)
    pub fn fail_on(&self, operation: &'static str) {
        self.with_state(|s| {
            s.failing.insert(operation);
        });
    }

    /// Only accept bundles imported with this password
    pub fn require_bundle_password(&self, password: impl Into<String>) {
        let password = password.into();
        self.with_state(|s| s.bundle_password = Some(password));
    }

    /// Create a store as if left behind by an earlier run
    pub fn insert_store(&self, store: &str) {
        self.with_state(|s| {
            s.stores.entry(store.to_string()).or_default();
        });
    }

    pub fn has_store(&self, store: &str) -> bool {
        self.with_state(|s| s.stores.contains_key(store))
    }

    /// Names of the stores that currently exist
    pub fn stores(&self) -> Vec<String> {
        self.with_state(|s| s.stores.keys().cloned().collect())
    }

    /// Operations performed, in order, e.g. `create:build.keychain-db`
    pub fn events(&self) -> Vec<String> {
        self.with_state(|s| s.events.clone())
    }

    /// Fingerprints probed, in order
    pub fn probes(&self) -> Vec<String> {
        self.with_state(|s| s.probes.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        // A panicking test thread must not hide the store from teardown
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Record `operation` and fail it when requested
    fn record(&self, operation: &'static str, store: &str) -> Result<()> {
        self.with_state(|s| {
            s.events.push(format!("{}:{}", operation, store));
            if s.failing.contains(operation) {
                Err(SigningError::KeychainError(format!(
                    "{} failed for {}",
                    operation, store
                )))
            } else {
                Ok(())
            }
        })
    }
}

fn no_such_store(store: &str) -> SigningError {
    SigningError::KeychainError(format!(
        "The specified keychain could not be found: {}",
        store
    ))
}

#[async_trait::async_trait]
impl IdentitySource for MemoryStore {
    async fn list_identities(
        &self,
        store: Option<&str>,
        policy: ListingPolicy,
    ) -> Result<Vec<IdentityRecord>> {
        self.with_state(|s| {
            let entries = match store {
                Some(store) => s.stores.get(store).ok_or_else(|| no_such_store(store))?,
                None => &s.search_list,
            };
            Ok(entries
                .iter()
                .filter(|(_, code_signing)| policy == ListingPolicy::Basic || *code_signing)
                .map(|(record, _)| record.clone())
                .collect())
        })
    }

    async fn probe(&self, identity: &Identity) -> Result<()> {
        self.with_state(|s| {
            s.probes.push(identity.fingerprint.clone());
            if s.dead.contains(&identity.fingerprint) {
                Err(SigningError::ToolFailed {
                    tool: "probe".to_string(),
                    reason: format!("no private key for {}", identity.fingerprint),
                })
            } else {
                Ok(())
            }
        })
    }
}

#[async_trait::async_trait]
impl StoreBackend for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn store_exists(&self, store: &str) -> Result<bool> {
        Ok(self.has_store(store))
    }

    async fn create_store(&self, store: &str, _secret: &str) -> Result<()> {
        self.record("create", store)?;
        self.with_state(|s| {
            if s.stores.contains_key(store) {
                return Err(SigningError::KeychainError(format!(
                    "a keychain named {} already exists",
                    store
                )));
            }
            s.stores.insert(store.to_string(), Vec::new());
            Ok(())
        })
    }

    async fn unlock_store(&self, store: &str, _secret: &str, _lock_timeout: Duration) -> Result<()> {
        self.record("unlock", store)
    }

    async fn import_bundle(
        &self,
        store: &str,
        bundle: &Path,
        password: &str,
        _tools: &[String],
    ) -> Result<()> {
        self.record("import", store)?;
        let content = std::fs::read(bundle)?;
        if content.is_empty() {
            return Err(SigningError::KeychainError("empty PKCS#12 bundle".to_string()));
        }
        self.with_state(|s| {
            if matches!(&s.bundle_password, Some(expected) if expected != password) {
                return Err(SigningError::KeychainError(
                    "MAC verification failed during PKCS12 import (wrong password?)".to_string(),
                ));
            }
            let imported = s.bundles.get(&content).cloned().unwrap_or_default();
            s.stores
                .get_mut(store)
                .ok_or_else(|| no_such_store(store))?
                .extend(imported);
            Ok(())
        })
    }

    async fn grant_access(&self, store: &str, _secret: &str, _tools: &[String]) -> Result<()> {
        self.record("grant", store)
    }

    async fn delete_store(&self, store: &str) -> Result<()> {
        self.delete_store_blocking(store)
    }

    fn delete_store_blocking(&self, store: &str) -> Result<()> {
        self.record("delete", store)?;
        self.with_state(|s| {
            s.stores.remove(store);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listing_policy_filters_installer_identities() {
        let store = MemoryStore::new();
        store.add_identity(IdentityRecord::new("A", "Developer ID Application: X"), true);
        store.add_identity(IdentityRecord::new("B", "Developer ID Installer: X"), false);

        let code_signing = store
            .list_identities(None, ListingPolicy::CodeSigning)
            .await
            .unwrap();
        assert_eq!(code_signing.len(), 1);

        let basic = store.list_identities(None, ListingPolicy::Basic).await.unwrap();
        assert_eq!(basic.len(), 2);
        assert_eq!(basic[0].fingerprint, "A");
    }

    #[tokio::test]
    async fn test_store_lifecycle() {
        let store = MemoryStore::new();
        store.create_store("k", "s").await.unwrap();
        assert!(store.store_exists("k").await.unwrap());
        assert!(store.create_store("k", "s").await.is_err());

        store.delete_store("k").await.unwrap();
        assert!(!store.has_store("k"));
        assert_eq!(store.events(), vec!["create:k", "create:k", "delete:k"]);
    }

    #[tokio::test]
    async fn test_imports_are_scoped_to_their_store() {
        let temp = tempfile::TempDir::new().unwrap();
        let bundle = temp.path().join("app.p12");
        std::fs::write(&bundle, b"pkcs12-app").unwrap();

        let store = MemoryStore::new();
        store.add_identity(IdentityRecord::new("D", "Developer ID Application: Default"), true);
        store.register_bundle(
            b"pkcs12-app".to_vec(),
            IdentityRecord::new("A", "Developer ID Application: X"),
            true,
        );
        store.create_store("one", "s").await.unwrap();
        store.create_store("two", "s").await.unwrap();

        assert!(store
            .list_identities(Some("one"), ListingPolicy::Basic)
            .await
            .unwrap()
            .is_empty());

        store.import_bundle("one", &bundle, "pw", &[]).await.unwrap();
        let one = store
            .list_identities(Some("one"), ListingPolicy::Basic)
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].fingerprint, "A");
        assert!(store
            .list_identities(Some("two"), ListingPolicy::Basic)
            .await
            .unwrap()
            .is_empty());

        let default = store.list_identities(None, ListingPolicy::Basic).await.unwrap();
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].fingerprint, "D");

        // Deleting a store takes its identities with it
        store.delete_store("one").await.unwrap();
        assert!(store
            .list_identities(Some("one"), ListingPolicy::Basic)
            .await
            .is_err());
        assert!(store.import_bundle("one", &bundle, "pw", &[]).await.is_err());
    }
}
