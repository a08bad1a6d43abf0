//! Ephemeral signing sessions
//!
//! A session owns a throwaway identity store for the duration of one build.
//! The store is created, unlocked, filled with the build's certificate
//! bundles and opened to the signing tools; when the session goes away the
//! store is deleted, whether the build finished, failed or panicked.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gantry_core::config::SigningConfig;
use gantry_core::Classification;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::backend::{IdentitySource, StoreBackend};
use crate::error::{Result, SigningError};
use crate::identity::ListingPolicy;
use crate::resolver::{IdentityResolver, ResolveConstraints};

/// Secret used to create and unlock the session store
#[derive(Clone)]
pub struct UnlockSecret(Zeroizing<String>);

impl UnlockSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    /// A random secret; nobody needs to know it after the session ends
    pub fn generate() -> Self {
        Self::new(format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UnlockSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnlockSecret(****)")
    }
}

#[derive(Clone)]
enum BundleData {
    File(PathBuf),
    Encoded(Zeroizing<String>),
}

/// A PKCS#12 certificate bundle and its password
#[derive(Clone)]
pub struct CertificateBundle {
    name: String,
    data: BundleData,
    password: Zeroizing<String>,
}

impl CertificateBundle {
    /// Bundle stored in a file
    pub fn from_file(path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            data: BundleData::File(path),
            password: Zeroizing::new(password.into()),
        }
    }

    /// Bundle passed around base64-encoded, as CI secrets usually are
    pub fn from_base64(
        name: impl Into<String>,
        encoded: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data: BundleData::Encoded(Zeroizing::new(encoded.into())),
            password: Zeroizing::new(password.into()),
        }
    }

    /// Name for logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("name", &self.name)
            .field("password", &"****")
            .finish_non_exhaustive()
    }
}

/// Build the bundle list from configuration.
///
/// Secrets come from `lookup`, normally the process environment.
pub fn bundles_from_config(
    config: &SigningConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<CertificateBundle>> {
    config
        .bundles
        .iter()
        .map(|bundle| {
            let password_env = bundle
                .password_env
                .as_deref()
                .unwrap_or(config.password_env.as_str());
            let password = lookup(password_env).ok_or_else(|| {
                SigningError::Configuration(format!(
                    "bundle password variable {} is not set",
                    password_env
                ))
            })?;

            match (&bundle.path, &bundle.base64_env) {
                (Some(path), None) => Ok(CertificateBundle::from_file(path, password)),
                (None, Some(var)) => {
                    let encoded = lookup(var).ok_or_else(|| {
                        SigningError::Configuration(format!(
                            "certificate variable {} is not set",
                            var
                        ))
                    })?;
                    Ok(CertificateBundle::from_base64(
                        format!("${}", var),
                        encoded,
                        password,
                    ))
                }
                _ => Err(SigningError::Configuration(
                    "a bundle needs exactly one of path or base64_env".to_string(),
                )),
            }
        })
        .collect()
}

/// Where the session store lives and who may use it
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Base store name. Every session's store carries its owner tag, so
    /// concurrent builds never share a store.
    pub store: String,

    /// Tag naming the session's store, normally the build id. Sessions
    /// without an owner get a random tag.
    pub owner: Option<String>,

    /// Tools allowed to use the imported keys
    pub grant_tools: Vec<String>,

    /// Auto-lock timeout
    pub lock_timeout: Duration,

    /// Classifications the imported bundles must provide
    pub required: Vec<Classification>,

    /// Team the required identities must belong to
    pub team_id: Option<String>,
}

impl SessionOptions {
    pub fn from_config(config: &SigningConfig) -> Self {
        Self {
            store: config.keychain.clone(),
            owner: None,
            grant_tools: config.grant_tools.clone(),
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
            required: Vec::new(),
            team_id: config.team_id.clone(),
        }
    }

    /// Name the session store after `build_id`
    pub fn for_build(mut self, build_id: impl Into<String>) -> Self {
        self.owner = Some(build_id.into());
        self
    }

    /// Require identities of each classification once bundles are imported
    pub fn requiring(
        mut self,
        classifications: impl IntoIterator<Item = Classification>,
        team_id: Option<String>,
    ) -> Self {
        for classification in classifications {
            if !self.required.contains(&classification) {
                self.required.push(classification);
            }
        }
        if team_id.is_some() {
            self.team_id = team_id;
        }
        self
    }

    /// Store name for the session tagged `tag`.
    ///
    /// The tag goes before the extension: `gantry-signing.keychain-db`
    /// tagged `b1` is `gantry-signing-b1.keychain-db`.
    pub fn store_name(&self, tag: &str) -> String {
        let tag: String = tag
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        match self.store.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
                format!("{}-{}.{}", stem, tag, ext)
            }
            _ => format!("{}-{}", self.store, tag),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&SigningConfig::default())
    }
}

/// Lifecycle of a session store. `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unborn,
    Created,
    Unlocked,
    CertificatesImported,
    AccessGranted,
    InUse,
    Released,
}

/// Hands out at most one signing session at a time
#[derive(Clone)]
pub struct SigningSessionManager {
    backend: Arc<dyn StoreBackend>,
    identities: Arc<dyn IdentitySource>,
    options: SessionOptions,
    active: Arc<Mutex<Option<String>>>,
}

impl SigningSessionManager {
    pub fn new<B>(backend: Arc<B>, options: SessionOptions) -> Self
    where
        B: StoreBackend + IdentitySource + 'static,
    {
        Self {
            backend: backend.clone(),
            identities: backend,
            options,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Whether a session currently holds the store
    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Create the session store and import `bundles` into it.
    ///
    /// Any stale store with the same name is removed first. The imported
    /// identities are checked before the session is handed out. If a later
    /// step fails, everything created so far is torn down before the error
    /// is returned.
    #[instrument(skip_all, fields(owner = ?self.options.owner, bundles = bundles.len()))]
    pub async fn acquire(
        &self,
        bundles: &[CertificateBundle],
        secret: UnlockSecret,
    ) -> Result<SigningSession> {
        let store = match &self.options.owner {
            Some(owner) => self.options.store_name(owner),
            None => {
                let tag = uuid::Uuid::new_v4().simple().to_string();
                self.options.store_name(&tag[..12])
            }
        };

        {
            let mut active = lock(&self.active);
            if let Some(store) = active.as_ref() {
                return Err(SigningError::SessionAlreadyActive {
                    store: store.clone(),
                });
            }
            *active = Some(store.clone());
        }

        // From here on the session's Drop frees the slot
        let mut session = SigningSession {
            store,
            backend: Arc::clone(&self.backend),
            state: SessionState::Unborn,
            slot: Arc::clone(&self.active),
        };

        match self.set_up(&mut session, bundles, &secret).await {
            Ok(()) => {
                session.transition(SessionState::InUse);
                info!(keychain = %session.store, "signing session ready");
                Ok(session)
            }
            Err(e) => {
                warn!(keychain = %session.store, state = ?session.state, error = %e, "signing session setup failed, tearing down");
                if let Err(teardown) = session.release().await {
                    error!(keychain = %session.store, error = %teardown, "teardown after failed setup did not complete");
                }
                Err(e)
            }
        }
    }

    async fn set_up(
        &self,
        session: &mut SigningSession,
        bundles: &[CertificateBundle],
        secret: &UnlockSecret,
    ) -> Result<()> {
        let store = session.store.clone();
        let store = store.as_str();
        let creation_failed = |reason: String| SigningError::StoreCreationFailed {
            store: store.to_string(),
            reason,
        };

        match self.backend.store_exists(store).await {
            Ok(true) => {
                warn!(keychain = %store, "removing stale keychain from an earlier run");
                self.backend
                    .delete_store(store)
                    .await
                    .map_err(|e| creation_failed(format!("stale store could not be removed: {}", e)))?;
            }
            Ok(false) => {}
            Err(e) => debug!(keychain = %store, error = %e, "could not check for a stale keychain"),
        }

        self.backend
            .create_store(store, secret.expose())
            .await
            .map_err(|e| creation_failed(e.to_string()))?;
        session.transition(SessionState::Created);

        self.backend
            .unlock_store(store, secret.expose(), self.options.lock_timeout)
            .await?;
        session.transition(SessionState::Unlocked);

        for bundle in bundles {
            self.import(store, bundle).await?;
        }
        session.transition(SessionState::CertificatesImported);

        self.backend
            .grant_access(store, secret.expose(), &self.options.grant_tools)
            .await?;
        session.transition(SessionState::AccessGranted);

        self.verify_identities(store, bundles).await
    }

    /// Confirm the store now holds the identities the build needs
    async fn verify_identities(&self, store: &str, bundles: &[CertificateBundle]) -> Result<()> {
        if self.options.required.is_empty() {
            let listed = self
                .identities
                .list_identities(Some(store), ListingPolicy::Basic)
                .await?;
            if listed.is_empty() {
                let bundle = if bundles.is_empty() {
                    "(no bundles)".to_string()
                } else {
                    bundles
                        .iter()
                        .map(|b| b.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                return Err(SigningError::ImportFailed {
                    bundle,
                    reason: format!("store {} holds no identities after import", store),
                });
            }
            debug!(keychain = %store, count = listed.len(), "identities available");
            return Ok(());
        }

        let resolver = IdentityResolver::for_store(Arc::clone(&self.identities), store);
        let constraints = ResolveConstraints {
            team_id: self.options.team_id.clone(),
            label_contains: None,
        };
        for classification in &self.options.required {
            let identity = resolver.resolve(*classification, &constraints).await?;
            debug!(keychain = %store, classification = %classification, label = %identity.label, "required identity present");
        }
        Ok(())
    }

    async fn import(&self, store: &str, bundle: &CertificateBundle) -> Result<()> {
        let import_failed = |reason: String| SigningError::ImportFailed {
            bundle: bundle.name.clone(),
            reason,
        };

        // Decoded bundles live in a private temp file until imported
        let mut staged = None;
        let path = match &bundle.data {
            BundleData::File(path) => {
                if !path.is_file() {
                    return Err(import_failed("file not found".to_string()));
                }
                path.clone()
            }
            BundleData::Encoded(encoded) => {
                let compact: Zeroizing<String> =
                    Zeroizing::new(encoded.chars().filter(|c| !c.is_whitespace()).collect());
                let bytes = Zeroizing::new(
                    STANDARD
                        .decode(compact.as_bytes())
                        .map_err(|e| import_failed(format!("invalid base64: {}", e)))?,
                );
                let mut file = tempfile::Builder::new()
                    .prefix("gantry-bundle-")
                    .suffix(".p12")
                    .tempfile()
                    .map_err(|e| import_failed(e.to_string()))?;
                file.write_all(&bytes)
                    .and_then(|_| file.flush())
                    .map_err(|e| import_failed(e.to_string()))?;
                let path = file.path().to_path_buf();
                staged = Some(file);
                path
            }
        };

        self.backend
            .import_bundle(
                store,
                &path,
                bundle.password.as_str(),
                &self.options.grant_tools,
            )
            .await
            .map_err(|e| import_failed(e.to_string()))?;
        drop(staged);

        info!(keychain = %store, bundle = %bundle.name, "imported certificate bundle");
        Ok(())
    }
}

impl fmt::Debug for SigningSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSessionManager")
            .field("backend", &self.backend.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Scoped ownership of the session store.
///
/// Call [`release`](Self::release) when done; dropping an unreleased session
/// deletes the store synchronously.
pub struct SigningSession {
    store: String,
    backend: Arc<dyn StoreBackend>,
    state: SessionState,
    slot: Arc<Mutex<Option<String>>>,
}

impl SigningSession {
    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_released(&self) -> bool {
        self.state == SessionState::Released
    }

    /// Delete the store. Calling this again is a no-op.
    pub async fn release(&mut self) -> Result<()> {
        if self.is_released() {
            return Ok(());
        }

        if self.state != SessionState::Unborn {
            if let Err(e) = self.backend.delete_store(&self.store).await {
                // Someone else already removed it
                if matches!(self.backend.store_exists(&self.store).await, Ok(true) | Err(_)) {
                    return Err(e);
                }
            }
        }

        self.transition(SessionState::Released);
        self.free_slot();
        info!(keychain = %self.store, "signing session released");
        Ok(())
    }

    fn transition(&mut self, to: SessionState) {
        debug!(keychain = %self.store, from = ?self.state, to = ?to, "session state");
        self.state = to;
    }

    fn free_slot(&self) {
        let mut slot = lock(&self.slot);
        if slot.as_deref() == Some(self.store.as_str()) {
            *slot = None;
        }
    }
}

impl fmt::Debug for SigningSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSession")
            .field("store", &self.store)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for SigningSession {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }
        if self.state != SessionState::Unborn {
            warn!(keychain = %self.store, state = ?self.state, "signing session dropped without release, deleting store");
            if let Err(e) = self.backend.delete_store_blocking(&self.store) {
                error!(keychain = %self.store, error = %e, "failed to delete signing store");
            }
        }
        self.state = SessionState::Released;
        self.free_slot();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
