//! Identity resolution cascade

use std::fmt;
use std::sync::Arc;

use gantry_core::Classification;
use tracing::{debug, info, instrument, warn};

use crate::backend::IdentitySource;
use crate::error::{Result, SigningError};
use crate::identity::{CascadeStep, Identity, IdentityRecord, ListingPolicy};

/// Optional narrowing of a resolution request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveConstraints {
    /// Team identifier the label must carry (relaxed by the cascade)
    pub team_id: Option<String>,

    /// Substring every candidate label must contain (never relaxed)
    pub label_contains: Option<String>,
}

impl ResolveConstraints {
    pub fn team(team_id: impl Into<String>) -> Self {
        Self {
            team_id: Some(team_id.into()),
            label_contains: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label_contains = Some(label.into());
        self
    }
}

/// What one cascade step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Skipped(&'static str),
    NoCandidate,
    ProbeFailed { fingerprint: String, reason: String },
    Selected { fingerprint: String },
}

/// Diagnostic record of one cascade step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: CascadeStep,
    pub result: StepResult,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            StepResult::Skipped(why) => write!(f, "{}: skipped ({})", self.step, why),
            StepResult::NoCandidate => write!(f, "{}: no candidate", self.step),
            StepResult::ProbeFailed {
                fingerprint,
                reason,
            } => write!(f, "{}: {} failed probe ({})", self.step, fingerprint, reason),
            StepResult::Selected { fingerprint } => {
                write!(f, "{}: selected {}", self.step, fingerprint)
            }
        }
    }
}

/// Resolves a classification to a live signing identity.
///
/// The store is listed once per resolution and each cascade step is a query
/// over those records. Candidates are taken in store order, never re-sorted.
#[derive(Clone)]
pub struct IdentityResolver {
    source: Arc<dyn IdentitySource>,
    store: Option<String>,
}

impl IdentityResolver {
    /// Resolver over the platform default search list
    pub fn new(source: Arc<dyn IdentitySource>) -> Self {
        Self {
            source,
            store: None,
        }
    }

    /// Resolver restricted to one store
    pub fn for_store(source: Arc<dyn IdentitySource>, store: impl Into<String>) -> Self {
        Self {
            source,
            store: Some(store.into()),
        }
    }

    pub fn store(&self) -> Option<&str> {
        self.store.as_deref()
    }

    /// List the identities a resolution for `classification` would consider
    pub async fn list(&self, classification: Classification) -> Result<Vec<IdentityRecord>> {
        self.source
            .list_identities(
                self.store.as_deref(),
                ListingPolicy::for_classification(classification),
            )
            .await
    }

    /// Resolve `classification` to a live identity.
    ///
    /// Fails with [`SigningError::NoIdentitiesFound`] once every step is
    /// exhausted. Never returns a guess.
    #[instrument(skip(self), fields(store = ?self.store))]
    pub async fn resolve(
        &self,
        classification: Classification,
        constraints: &ResolveConstraints,
    ) -> Result<Identity> {
        let listed = self.list(classification).await?;
        let labels: Vec<String> = listed.iter().map(|r| r.label.clone()).collect();
        debug!(count = listed.len(), "listed identities");

        let records: Vec<&IdentityRecord> = listed
            .iter()
            .filter(|r| {
                if r.is_expired() {
                    debug!(fingerprint = %r.fingerprint, label = %r.label, "skipping expired identity");
                    return false;
                }
                constraints
                    .label_contains
                    .as_deref()
                    .map_or(true, |needle| r.label.contains(needle))
            })
            .collect();

        if classification == Classification::Other {
            return self
                .resolve_unclassified(&records, constraints, labels)
                .await;
        }

        let mut outcomes = Vec::with_capacity(CascadeStep::ALL.len());
        for step in CascadeStep::ALL {
            let result = match select(step, classification, constraints, &records) {
                Err(why) => StepResult::Skipped(why),
                Ok(None) => StepResult::NoCandidate,
                Ok(Some(record)) => {
                    let identity =
                        Identity::from_record(record, classification, step, self.store.as_deref());
                    match self.source.probe(&identity).await {
                        Ok(()) => {
                            info!(
                                classification = %classification,
                                step = %step,
                                label = %identity.label,
                                fingerprint = %identity.fingerprint,
                                "resolved signing identity"
                            );
                            return Ok(identity);
                        }
                        Err(e) => {
                            warn!(
                                step = %step,
                                fingerprint = %record.fingerprint,
                                error = %e,
                                "identity failed liveness probe"
                            );
                            StepResult::ProbeFailed {
                                fingerprint: record.fingerprint.clone(),
                                reason: e.to_string(),
                            }
                        }
                    }
                }
            };
            debug!(step = %step, result = ?result, "cascade step exhausted");
            outcomes.push(StepOutcome { step, result });
        }

        Err(SigningError::NoIdentitiesFound {
            classification,
            labels,
            steps: outcomes.iter().map(ToString::to_string).collect(),
        })
    }

    /// `Other` has no canonical label, so the cascade has nothing to match
    /// on. A single identity (after constraints) is unambiguous.
    async fn resolve_unclassified(
        &self,
        records: &[&IdentityRecord],
        constraints: &ResolveConstraints,
        labels: Vec<String>,
    ) -> Result<Identity> {
        let candidates: Vec<&IdentityRecord> = records
            .iter()
            .copied()
            .filter(|r| {
                constraints
                    .team_id
                    .as_deref()
                    .map_or(true, |team| r.label.contains(team))
            })
            .collect();

        if candidates.len() > 1 && constraints.label_contains.is_none() {
            return Err(SigningError::AmbiguousWithoutConstraint {
                classification: Classification::Other,
                count: candidates.len(),
                labels: candidates.iter().map(|r| r.label.clone()).collect(),
            });
        }

        let step = CascadeStep::Canonical;
        let Some(record) = candidates.first() else {
            return Err(SigningError::NoIdentitiesFound {
                classification: Classification::Other,
                labels,
                steps: vec![StepOutcome {
                    step,
                    result: StepResult::NoCandidate,
                }
                .to_string()],
            });
        };

        let identity =
            Identity::from_record(record, Classification::Other, step, self.store.as_deref());
        match self.source.probe(&identity).await {
            Ok(()) => Ok(identity),
            Err(e) => Err(SigningError::NoIdentitiesFound {
                classification: Classification::Other,
                labels,
                steps: vec![StepOutcome {
                    step,
                    result: StepResult::ProbeFailed {
                        fingerprint: record.fingerprint.clone(),
                        reason: e.to_string(),
                    },
                }
                .to_string()],
            }),
        }
    }
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// First record in store order that `step` accepts.
///
/// `Err` carries the reason a step does not apply.
fn select<'a>(
    step: CascadeStep,
    classification: Classification,
    constraints: &ResolveConstraints,
    records: &[&'a IdentityRecord],
) -> std::result::Result<Option<&'a IdentityRecord>, &'static str> {
    let team = constraints.team_id.as_deref();
    let canonical = classification.canonical_label();

    let found = match step {
        CascadeStep::Canonical => {
            let canonical = canonical.ok_or("no canonical label")?;
            records.iter().find(|r| {
                r.label.contains(canonical) && team.map_or(true, |t| r.label.contains(t))
            })
        }
        CascadeStep::CanonicalWithoutTeam => {
            if team.is_none() {
                return Err("no team constraint");
            }
            let canonical = canonical.ok_or("no canonical label")?;
            records.iter().find(|r| r.label.contains(canonical))
        }
        CascadeStep::Fingerprint => {
            let canonical = canonical.ok_or("no canonical label")?;
            records.iter().find(|r| r.raw.contains(canonical))
        }
        CascadeStep::Broadened => {
            let markers = classification.broadened_labels();
            records.iter().find(|r| {
                markers.iter().any(|m| r.label.contains(m)) && passes_guard(classification, r)
            })
        }
        CascadeStep::BroadenedFingerprint => {
            let markers = classification.broadened_labels();
            records.iter().find(|r| {
                markers.iter().any(|m| r.raw.contains(m)) && passes_guard(classification, r)
            })
        }
    };

    Ok(found.copied())
}

/// Broadened markers like "Apple" also match identities meant for another
/// purpose; reject a label that names a different known classification.
fn passes_guard(wanted: Classification, record: &IdentityRecord) -> bool {
    match Classification::from_label(&record.label) {
        Classification::Other => true,
        found => found == wanted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;

    const APP: &str = "Developer ID Application: X (ABC123)";
    const PKG: &str = "Developer ID Installer: X (ABC123)";

    fn fp(n: u8) -> String {
        format!("{:040X}", n)
    }

    fn resolver(store: &Arc<MemoryStore>) -> IdentityResolver {
        IdentityResolver::new(store.clone())
    }

    #[tokio::test]
    async fn test_installer_vs_application_with_team() {
        let store = Arc::new(MemoryStore::new());
        store.add_identity(IdentityRecord::new(fp(1), APP), true);
        store.add_identity(IdentityRecord::new(fp(2), PKG), false);

        let identity = resolver(&store)
            .resolve(
                Classification::InstallerSigning,
                &ResolveConstraints::team("ABC123"),
            )
            .await
            .unwrap();

        assert_eq!(identity.label, PKG);
        assert_eq!(identity.fingerprint, fp(2));
        assert_eq!(identity.classification, Classification::InstallerSigning);
        assert_eq!(identity.resolved_by, CascadeStep::Canonical);
        assert_eq!(identity.team_id.as_deref(), Some("ABC123"));

        let app = resolver(&store)
            .resolve(
                Classification::ApplicationSigning,
                &ResolveConstraints::team("ABC123"),
            )
            .await
            .unwrap();
        assert_eq!(app.label, APP);
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.add_identity(IdentityRecord::new(fp(1), APP), true);
        store.add_identity(
            IdentityRecord::new(fp(3), "Developer ID Application: Y (ZZZ999)"),
            true,
        );
        let resolver = resolver(&store);
        let constraints = ResolveConstraints::default();

        let first = resolver
            .resolve(Classification::ApplicationSigning, &constraints)
            .await
            .unwrap();
        let second = resolver
            .resolve(Classification::ApplicationSigning, &constraints)
            .await
            .unwrap();
        assert_eq!(first, second);
        // First in store order wins
        assert_eq!(first.fingerprint, fp(1));
    }

    #[tokio::test]
    async fn test_team_constraint_is_relaxed() {
        let store = Arc::new(MemoryStore::new());
        store.add_identity(IdentityRecord::new(fp(1), APP), true);

        let identity = resolver(&store)
            .resolve(
                Classification::ApplicationSigning,
                &ResolveConstraints::team("OTHER1"),
            )
            .await
            .unwrap();
        assert_eq!(identity.resolved_by, CascadeStep::CanonicalWithoutTeam);
    }

    #[tokio::test]
    async fn test_no_identities_found_lists_labels() {
        let store = Arc::new(MemoryStore::new());
        store.add_identity(IdentityRecord::new(fp(1), "Mac Developer: Someone (QQQ111)"), false);
        store.add_identity(IdentityRecord::new(fp(2), APP), true);

        let err = resolver(&store)
            .resolve(
                Classification::InstallerSigning,
                &ResolveConstraints::team("ABC123"),
            )
            .await
            .unwrap_err();

        match &err {
            SigningError::NoIdentitiesFound {
                classification,
                labels,
                steps,
            } => {
                assert_eq!(*classification, Classification::InstallerSigning);
                assert_eq!(
                    labels,
                    &vec!["Mac Developer: Someone (QQQ111)".to_string(), APP.to_string()]
                );
                assert_eq!(steps.len(), 5);
                assert!(steps[0].starts_with("canonical: no candidate"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("Mac Developer: Someone"));
    }

    #[tokio::test]
    async fn test_empty_store() {
        let store = Arc::new(MemoryStore::new());
        let err = resolver(&store)
            .resolve(Classification::ApplicationSigning, &ResolveConstraints::default())
            .await
            .unwrap_err();
        match err {
            SigningError::NoIdentitiesFound { labels, steps, .. } => {
                assert!(labels.is_empty());
                assert!(steps[1].contains("skipped (no team constraint)"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_failure_falls_through() {
        let store = Arc::new(MemoryStore::new());
        store.add_identity(
            IdentityRecord::new(fp(2), "Developer ID Application: Y (ZZZ999)"),
            true,
        );
        store.add_identity(IdentityRecord::new(fp(1), APP), true);
        store.fail_probe(&fp(1));

        let identity = resolver(&store)
            .resolve(
                Classification::ApplicationSigning,
                &ResolveConstraints::team("ABC123"),
            )
            .await
            .unwrap();

        // The team match has no usable key; the relaxed step takes the next
        assert_eq!(identity.fingerprint, fp(2));
        assert_eq!(identity.resolved_by, CascadeStep::CanonicalWithoutTeam);
        assert_eq!(store.probes(), vec![fp(1), fp(2)]);
    }

    #[tokio::test]
    async fn test_broadened_match_rejects_other_purpose() {
        let store = Arc::new(MemoryStore::new());
        // Only an application identity; the "Developer ID" marker matches it
        store.add_identity(IdentityRecord::new(fp(1), APP), true);

        let err = resolver(&store)
            .resolve(Classification::InstallerSigning, &ResolveConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SigningError::NoIdentitiesFound { .. }));
    }

    #[tokio::test]
    async fn test_broadened_match_accepts_generic_label() {
        let store = Arc::new(MemoryStore::new());
        store.add_identity(IdentityRecord::new(fp(9), "Apple Worldwide Signing: X"), false);

        let identity = resolver(&store)
            .resolve(Classification::InstallerSigning, &ResolveConstraints::default())
            .await
            .unwrap();
        assert_eq!(identity.resolved_by, CascadeStep::Broadened);
        assert_eq!(identity.tool_reference(), identity.label);
    }

    #[tokio::test]
    async fn test_fingerprint_step_uses_raw_line() {
        let store = Arc::new(MemoryStore::new());
        // Label mangled by the store; the raw line still names the class
        let mut record = IdentityRecord::new(fp(4), "X (ABC123)");
        record.raw = format!("1) {} \"Developer ID Application: X (ABC123)\"", fp(4));
        store.add_identity(record, true);

        let identity = resolver(&store)
            .resolve(Classification::ApplicationSigning, &ResolveConstraints::default())
            .await
            .unwrap();
        assert_eq!(identity.resolved_by, CascadeStep::Fingerprint);
        assert_eq!(identity.tool_reference(), fp(4));
    }

    #[tokio::test]
    async fn test_expired_identities_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.add_identity(
            IdentityRecord::new(fp(1), APP)
                .with_not_after(chrono::Utc::now() - chrono::Duration::days(1)),
            true,
        );
        store.add_identity(
            IdentityRecord::new(fp(2), "Developer ID Application: X (ABC123) 2"),
            true,
        );

        let identity = resolver(&store)
            .resolve(Classification::ApplicationSigning, &ResolveConstraints::default())
            .await
            .unwrap();
        assert_eq!(identity.fingerprint, fp(2));
    }

    #[tokio::test]
    async fn test_unclassified_requires_constraint_when_ambiguous() {
        let store = Arc::new(MemoryStore::new());
        store.add_identity(IdentityRecord::new(fp(1), "Internal Signing: A"), false);
        store.add_identity(IdentityRecord::new(fp(2), "Internal Signing: B"), false);

        let resolver = resolver(&store);
        let err = resolver
            .resolve(Classification::Other, &ResolveConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SigningError::AmbiguousWithoutConstraint { count: 2, .. }
        ));

        let identity = resolver
            .resolve(
                Classification::Other,
                &ResolveConstraints::default().with_label("Signing: B"),
            )
            .await
            .unwrap();
        assert_eq!(identity.fingerprint, fp(2));
    }

    #[tokio::test]
    async fn test_store_scoped_resolution() {
        let store = Arc::new(MemoryStore::new());
        // The default search list holds a different application identity
        store.add_identity(IdentityRecord::new(fp(1), APP), true);
        store.add_identity_to(
            "build.keychain-db",
            IdentityRecord::new(fp(2), "Developer ID Application: Build (ABC123)"),
            true,
        );
        store.add_identity_to("other.keychain-db", IdentityRecord::new(fp(3), PKG), false);

        let resolver = IdentityResolver::for_store(store.clone(), "build.keychain-db");
        let identity = resolver
            .resolve(Classification::ApplicationSigning, &ResolveConstraints::default())
            .await
            .unwrap();
        assert_eq!(identity.fingerprint, fp(2));
        assert_eq!(identity.keychain.as_deref(), Some("build.keychain-db"));

        // Identities in other stores are invisible to a scoped resolver
        let err = resolver
            .resolve(Classification::InstallerSigning, &ResolveConstraints::default())
            .await
            .unwrap_err();
        match err {
            SigningError::NoIdentitiesFound { labels, .. } => {
                assert_eq!(labels, vec!["Developer ID Application: Build (ABC123)"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!store.probes().contains(&fp(1)));
    }
}
