//! Writes the active CA into the `MutatingWebhookConfiguration`.
//!
//! Off by default: cert-manager's CA injector normally owns `caBundle`.
//! When enabled, every newly activated certificate generation is followed by
//! a JSON patch setting `clientConfig.caBundle` on each webhook whose bundle
//! differs.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use snatch_core::{PatchOperation, PatchPath};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::store::CertificateStore;
use crate::webhook::to_json_patch;
use crate::{Error, Result, metrics};

const MAX_ATTEMPTS: usize = 5;

/// Keeps the webhook configuration's `caBundle` in step with the store.
#[derive(Clone)]
pub struct CaInjector {
    api: Api<MutatingWebhookConfiguration>,
    name: String,
}

impl CaInjector {
    /// Inject into the cluster-scoped configuration `name`.
    pub fn new(client: Client, name: &str) -> Self {
        Self {
            api: Api::all(client),
            name: name.to_string(),
        }
    }

    /// Set `caBundle` on every webhook of the configuration.
    ///
    /// Returns `false` when all webhooks already carried `ca_pem`.
    pub async fn inject(&self, ca_pem: &[u8]) -> Result<bool> {
        let current = self.api.get(&self.name).await?;
        let ops = ca_bundle_operations(&current, ca_pem)?;
        if ops.is_empty() {
            return Ok(false);
        }
        let patch = to_json_patch(&ops)?;
        self.api
            .patch(
                &self.name,
                &PatchParams::default(),
                &Patch::<()>::Json(patch),
            )
            .await?;
        Ok(true)
    }

    /// [`Self::inject`] with exponential backoff on transient errors.
    pub async fn inject_with_retry(&self, ca_pem: &[u8]) -> Result<bool> {
        (|| async { self.inject(ca_pem).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(200))
                    .with_max_delay(Duration::from_secs(10))
                    .with_max_times(MAX_ATTEMPTS),
            )
            .when(Error::is_transient)
            .notify(|e: &Error, delay: Duration| {
                debug!(error = %e, delay = ?delay, "Retrying CA bundle injection");
            })
            .await
    }

    /// Inject after every activation until shutdown.
    pub async fn run(
        self,
        store: Arc<CertificateStore>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut generations = store.subscribe();
        // the current generation counts as a change
        generations.mark_changed();

        loop {
            tokio::select! {
                changed = generations.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }

            let Some(bundle) = store.snapshot() else {
                continue;
            };
            let Some(ca_pem) = bundle.ca_pem() else {
                warn!(
                    generation = bundle.generation(),
                    "Active certificate has no ca.crt, skipping CA bundle injection"
                );
                metrics::record_ca_injection("skipped");
                continue;
            };

            match self.inject_with_retry(ca_pem).await {
                Ok(true) => {
                    info!(
                        webhook_configuration = %self.name,
                        generation = bundle.generation(),
                        "Injected CA bundle"
                    );
                    metrics::record_ca_injection("success");
                }
                Ok(false) => {
                    debug!(webhook_configuration = %self.name, "CA bundle already current");
                    metrics::record_ca_injection("unchanged");
                }
                Err(e) => {
                    warn!(
                        webhook_configuration = %self.name,
                        error = %e,
                        "CA bundle injection failed"
                    );
                    metrics::record_ca_injection("failure");
                }
            }
        }

        info!("CA injector shutting down");
    }
}

/// Patch operations setting `caBundle` on each webhook that differs.
///
/// # Errors
///
/// Returns an error if the bundle cannot be encoded.
pub fn ca_bundle_operations(
    config: &MutatingWebhookConfiguration,
    ca_pem: &[u8],
) -> Result<Vec<PatchOperation>> {
    let encoded = serde_json::to_value(ByteString(ca_pem.to_vec()))?;
    let ops = config
        .webhooks
        .iter()
        .flatten()
        .enumerate()
        .filter(|(_, webhook)| {
            webhook.client_config.ca_bundle.as_ref().map(|b| b.0.as_slice()) != Some(ca_pem)
        })
        .map(|(index, _)| PatchOperation::Add {
            path: PatchPath::new([
                "webhooks".to_string(),
                index.to_string(),
                "clientConfig".to_string(),
                "caBundle".to_string(),
            ]),
            value: encoded.clone(),
        })
        .collect();
    Ok(ops)
}
