//! In-memory owner of the active serving certificate.
//!
//! The store is a small state machine:
//!
//! ```text
//! Uninitialized ──install──▶ Active ──begin_reload──▶ Reloading ──install──▶ Active
//!                               ▲                         │
//!                               │                    mark_failed
//!                               └───────install────── Failed
//! ```
//!
//! Readers call [`CertificateStore::snapshot`] and get the last good bundle
//! in every state but `Uninitialized`. Generations are assigned here, so the
//! sequence of active bundles observed through the store is strictly
//! increasing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::watch;
use tracing::{info, warn};

use super::bundle::CertificateBundle;
use crate::{Error, Result};

/// Lifecycle state of the store.
#[derive(Debug, Clone)]
pub enum CertState {
    /// No bundle has been loaded yet
    Uninitialized,
    /// Serving the contained bundle
    Active(Arc<CertificateBundle>),
    /// A changed source is being validated; `previous` keeps serving
    Reloading {
        /// Bundle served while the reload runs
        previous: Option<Arc<CertificateBundle>>,
    },
    /// The latest change did not validate; `last_good` keeps serving
    Failed {
        /// Bundle served until a valid change arrives
        last_good: Option<Arc<CertificateBundle>>,
        /// Why the change was rejected
        reason: String,
    },
}

impl CertState {
    /// Short label for logs and probes.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Active(_) => "active",
            Self::Reloading { .. } => "reloading",
            Self::Failed { .. } => "failed",
        }
    }

    fn serving(&self) -> Option<&Arc<CertificateBundle>> {
        match self {
            Self::Uninitialized => None,
            Self::Active(bundle) => Some(bundle),
            Self::Reloading { previous } => previous.as_ref(),
            Self::Failed { last_good, .. } => last_good.as_ref(),
        }
    }
}

/// Result of [`CertificateStore::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// A new bundle became active under this generation
    Activated(u64),
    /// The bundle has the active fingerprint; nothing changed
    Unchanged(u64),
}

struct Inner {
    state: CertState,
    last_generation: u64,
}

/// Owner of the active [`CertificateBundle`].
pub struct CertificateStore {
    inner: RwLock<Inner>,
    generation_tx: watch::Sender<u64>,
}

impl CertificateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                state: CertState::Uninitialized,
                last_generation: 0,
            }),
            generation_tx,
        }
    }

    /// The bundle currently served, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<CertificateBundle>> {
        self.inner.read().state.serving().cloned()
    }

    /// A copy of the current state.
    #[must_use]
    pub fn state(&self) -> CertState {
        self.inner.read().state.clone()
    }

    /// Whether a bundle can be served.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Fingerprint of the served bundle.
    #[must_use]
    pub fn active_fingerprint(&self) -> Option<String> {
        self.snapshot().map(|b| b.fingerprint().to_string())
    }

    /// Enter `Reloading`, keeping the served bundle.
    pub fn begin_reload(&self) {
        let mut inner = self.inner.write();
        let previous = inner.state.serving().cloned();
        inner.state = CertState::Reloading { previous };
    }

    /// Activate a validated bundle.
    ///
    /// A bundle whose fingerprint equals the served one only restores the
    /// `Active` state; the generation does not move.
    pub fn install(&self, bundle: CertificateBundle) -> InstallOutcome {
        let mut inner = self.inner.write();

        if let Some(current) = inner.state.serving().cloned() {
            if current.fingerprint() == bundle.fingerprint() {
                let generation = current.generation();
                inner.state = CertState::Active(current);
                return InstallOutcome::Unchanged(generation);
            }
        }

        inner.last_generation += 1;
        let generation = inner.last_generation;
        let bundle = Arc::new(bundle.with_generation(generation));
        info!(
            generation,
            fingerprint = %bundle.fingerprint(),
            not_after = bundle.not_after(),
            "Activated serving certificate"
        );
        inner.state = CertState::Active(bundle);
        drop(inner);

        self.generation_tx.send_replace(generation);
        InstallOutcome::Activated(generation)
    }

    /// Record a rejected change; the served bundle stays.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.write();
        let last_good = inner.state.serving().cloned();
        warn!(
            reason = %reason,
            serving_generation = last_good.as_ref().map(|b| b.generation()),
            "Certificate change rejected, keeping last good certificate"
        );
        inner.state = CertState::Failed { last_good, reason };
    }

    /// Receives every newly activated generation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Wait until a bundle is served.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Certificate`] if nothing became active within `timeout`.
    pub async fn wait_active(&self, timeout: Duration) -> Result<Arc<CertificateBundle>> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if let Some(bundle) = self.snapshot() {
                    return Some(bundle);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        match waited {
            Ok(Some(bundle)) => Ok(bundle),
            Ok(None) => Err(Error::Shutdown),
            Err(_) => {
                let state = self.state();
                let detail = match &state {
                    CertState::Failed { reason, .. } => format!(": {reason}"),
                    _ => String::new(),
                };
                Err(Error::Certificate(format!(
                    "no valid serving certificate within {timeout:?} (state {}){detail}",
                    state.name()
                )))
            }
        }
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("CertificateStore")
            .field("state", &inner.state.name())
            .field("last_generation", &inner.last_generation)
            .finish()
    }
}

/// Picks the served certificate at every TLS handshake.
///
/// Established connections keep the key they negotiated; only new
/// handshakes see a rotated certificate.
#[derive(Debug, Clone)]
pub struct StoreCertResolver {
    store: Arc<CertificateStore>,
}

impl StoreCertResolver {
    /// Resolve from `store`.
    #[must_use]
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }
}

impl ResolvesServerCert for StoreCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.store.snapshot().map(|bundle| bundle.certified_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::bundle::CertificateMaterial;
    use crate::tls::generate::{CaParams, CertGenerator, ServingCertParams};

    fn bundle() -> CertificateBundle {
        let ca = CertGenerator::init_ca(&CaParams {
            cn: "store test CA",
            validity_days: 30,
        })
        .unwrap();
        let leaf = CertGenerator::issue_serving(
            &ServingCertParams {
                san_dns: vec!["localhost".into()],
                validity_days: 30,
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();
        CertificateBundle::validate(CertificateMaterial {
            cert_pem: leaf.cert_pem.into_bytes(),
            key_pem: leaf.key_pem.into_bytes(),
            ca_pem: Some(ca.cert_pem.into_bytes()),
        })
        .unwrap()
    }

    #[test]
    fn new_store_serves_nothing() {
        let store = CertificateStore::new();
        assert!(store.snapshot().is_none());
        assert!(!store.is_ready());
        assert_eq!(store.state().name(), "uninitialized");
    }

    #[test]
    fn first_install_activates_generation_one() {
        let store = CertificateStore::new();
        assert_eq!(store.install(bundle()), InstallOutcome::Activated(1));
        assert_eq!(store.snapshot().unwrap().generation(), 1);
        assert_eq!(*store.subscribe().borrow(), 1);
    }

    #[test]
    fn same_fingerprint_does_not_bump_generation() {
        // GIVEN: an active bundle
        let store = CertificateStore::new();
        let b = bundle();
        let again = CertificateBundle::validate(b.material().clone()).unwrap();
        store.install(b);
        // WHEN: the same material is installed again after a reload
        store.begin_reload();
        let outcome = store.install(again);
        // THEN: unchanged, back to active
        assert_eq!(outcome, InstallOutcome::Unchanged(1));
        assert_eq!(store.state().name(), "active");
    }

    #[test]
    fn reloading_keeps_serving_previous() {
        let store = CertificateStore::new();
        store.install(bundle());
        let fp = store.active_fingerprint().unwrap();

        store.begin_reload();

        assert_eq!(store.state().name(), "reloading");
        assert_eq!(store.active_fingerprint().unwrap(), fp);
    }

    #[test]
    fn failure_keeps_last_good_and_recovers() {
        // GIVEN: generation 1 active
        let store = CertificateStore::new();
        store.install(bundle());
        let fp = store.active_fingerprint().unwrap();
        // WHEN: a change is rejected
        store.begin_reload();
        store.mark_failed("tls.key does not match tls.crt");
        // THEN: still serving generation 1
        assert_eq!(store.state().name(), "failed");
        assert_eq!(store.active_fingerprint().unwrap(), fp);
        // WHEN: a valid change arrives
        store.begin_reload();
        assert_eq!(store.install(bundle()), InstallOutcome::Activated(2));
        // THEN: active again with a new fingerprint
        assert_ne!(store.active_fingerprint().unwrap(), fp);
    }

    #[test]
    fn certified_key_follows_rotation() {
        let store = Arc::new(CertificateStore::new());
        store.install(bundle());
        let before = store.snapshot().unwrap().certified_key();
        store.install(bundle());
        let after = store.snapshot().unwrap().certified_key();
        assert_ne!(before.cert, after.cert);
    }

    #[tokio::test]
    async fn wait_active_times_out_when_nothing_loads() {
        let store = CertificateStore::new();
        store.mark_failed("no such file");
        let err = store
            .wait_active(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such file"), "{err}");
    }

    #[tokio::test]
    async fn wait_active_returns_once_installed() {
        let store = Arc::new(CertificateStore::new());
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_active(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        store.install(bundle());
        let active = waiter.await.unwrap().unwrap();
        assert_eq!(active.generation(), 1);
    }
}
