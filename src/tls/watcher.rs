//! Single-owner reload loop feeding the certificate store.
//!
//! The watcher is the only writer of the [`CertificateStore`]. It reloads on
//! file-system events (debounced) and on a poll interval, because secret
//! sources have no events and projected volumes can miss them. A change
//! arriving while a reload is in flight cancels that reload and starts over.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::bundle::CertificateBundle;
use super::source::CertificateSource;
use super::store::{CertState, CertificateStore, InstallOutcome};
use crate::{Result, metrics};

/// What a single reload attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The source matches the active bundle
    Unchanged,
    /// A new bundle became active under this generation
    Activated(u64),
    /// The source could not be read or did not validate
    Rejected(String),
}

/// Watches a [`CertificateSource`] and installs validated bundles.
pub struct CertificateWatcher {
    source: Arc<dyn CertificateSource>,
    store: Arc<CertificateStore>,
    poll_interval: Duration,
    debounce: Duration,
    last_rejected: Option<String>,
    last_failure: Option<String>,
}

impl CertificateWatcher {
    /// Create a watcher over `source` writing into `store`.
    pub fn new(
        source: Arc<dyn CertificateSource>,
        store: Arc<CertificateStore>,
        poll_interval: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            source,
            store,
            // tokio rejects a zero period
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            debounce,
            last_rejected: None,
            last_failure: None,
        }
    }

    /// Read the source once and update the store.
    pub async fn reload(&mut self) -> ReloadOutcome {
        let material = match self.source.load().await {
            Ok(material) => material,
            Err(e) => return self.reject(e.to_string(), None),
        };

        let fingerprint = material.fingerprint();
        let state = self.store.state();
        if let CertState::Active(active) = &state {
            if active.fingerprint() == fingerprint {
                return ReloadOutcome::Unchanged;
            }
        }
        if self.last_rejected.as_deref() == Some(fingerprint.as_str()) {
            debug!(fingerprint = %fingerprint, "Source still holds rejected material");
            return ReloadOutcome::Rejected(self.last_failure.clone().unwrap_or_default());
        }
        // a plain rewrite of the directory can expose tls.crt/tls.key before ca.crt
        if material.ca_pem.is_none()
            && self.store.snapshot().is_some_and(|b| b.ca_pem().is_some())
        {
            return self.reject(
                "ca.crt is missing while the served certificate carries one".into(),
                Some(fingerprint),
            );
        }

        self.store.begin_reload();
        match CertificateBundle::validate(material) {
            Ok(bundle) => {
                self.last_rejected = None;
                self.last_failure = None;
                match self.store.install(bundle) {
                    InstallOutcome::Activated(generation) => {
                        metrics::record_certificate_reload("success");
                        metrics::set_certificate_generation(generation);
                        ReloadOutcome::Activated(generation)
                    }
                    InstallOutcome::Unchanged(_) => ReloadOutcome::Unchanged,
                }
            }
            Err(e) => self.reject(e.to_string(), Some(fingerprint)),
        }
    }

    /// Surface a failed reload.
    ///
    /// New material is always recorded. An unreadable source repeating the
    /// same error while the store already shows it is only counted once.
    fn reject(&mut self, reason: String, fingerprint: Option<String>) -> ReloadOutcome {
        let already_surfaced = fingerprint.is_none()
            && self.last_failure.as_deref() == Some(reason.as_str())
            && matches!(self.store.state(), CertState::Failed { .. });
        if !already_surfaced {
            metrics::record_certificate_reload("failure");
            self.store.mark_failed(reason.clone());
        }
        self.last_failure = Some(reason.clone());
        self.last_rejected = fingerprint;
        ReloadOutcome::Rejected(reason)
    }

    /// Run until shutdown.
    ///
    /// The first poll tick fires immediately, so the initial load happens
    /// without waiting for an interval.
    pub async fn run(self, shutdown_rx: broadcast::Receiver<()>) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let _fs_watcher = match self.source.watch_dir() {
            Some(dir) => match create_fs_watcher(event_tx, dir) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, "File watching unavailable, relying on polling");
                    None
                }
            },
            None => None,
        };

        info!(
            source = %self.source.describe(),
            poll_interval = ?self.poll_interval,
            "Watching serving certificate"
        );
        self.watch_loop(event_rx, shutdown_rx).await;
    }

    async fn watch_loop(
        mut self,
        mut event_rx: mpsc::Receiver<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                Some(()) = event_rx.recv() => {
                    settle(&mut event_rx, self.debounce).await;
                }
                _ = shutdown_rx.recv() => break,
            }

            // a change arriving mid-reload supersedes it
            loop {
                let debounce = self.debounce;
                tokio::select! {
                    outcome = self.reload() => {
                        log_outcome(&outcome);
                        break;
                    }
                    Some(()) = event_rx.recv() => {
                        debug!("Certificate source changed during reload, restarting");
                        settle(&mut event_rx, debounce).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Certificate watcher shutting down");
                        return;
                    }
                }
            }
        }

        info!("Certificate watcher shutting down");
    }
}

/// Wait until no event arrived for `debounce`.
async fn settle(event_rx: &mut mpsc::Receiver<()>, debounce: Duration) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(debounce) => return,
            Some(()) = event_rx.recv() => {}
        }
    }
}

fn log_outcome(outcome: &ReloadOutcome) {
    match outcome {
        ReloadOutcome::Unchanged => debug!("Serving certificate unchanged"),
        ReloadOutcome::Activated(generation) => {
            info!(generation, "Serving certificate reloaded");
        }
        ReloadOutcome::Rejected(reason) => {
            debug!(reason = %reason, "Serving certificate reload rejected");
        }
    }
}

fn create_fs_watcher(event_tx: mpsc::Sender<()>, dir: &Path) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| match result {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    debug!(paths = ?event.paths, kind = ?event.kind, "Certificate file change");
                    // a full channel already has a reload pending
                    let _ = event_tx.try_send(());
                }
            }
            Err(e) => {
                error!(error = %e, "Certificate file watcher error");
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| crate::Error::Internal(format!("Failed to create file watcher: {e}")))?;

    // non-recursive: kubelet swaps the `..data` symlink inside the directory
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| {
            crate::Error::Internal(format!("Failed to watch '{}': {e}", dir.display()))
        })?;
    info!(directory = %dir.display(), "Watching for certificate changes");

    Ok(watcher)
}
