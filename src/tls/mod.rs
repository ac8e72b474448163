//! Serving certificate lifecycle
//!
//! - [`CertificateSource`]: where PEM material comes from (directory or secret)
//! - [`CertificateWatcher`]: the single writer, reloading on change
//! - [`CertificateStore`]: the active bundle, snapshot-read per handshake
//! - [`CaInjector`]: optional `caBundle` propagation
//! - [`CertGenerator`]: development CA and serving certificates

pub mod bundle;
pub mod ca_injection;
pub mod generate;
pub mod source;
pub mod store;
pub mod watcher;

use std::sync::Arc;

use rustls::ServerConfig;

pub use bundle::{CertificateBundle, CertificateMaterial};
pub use ca_injection::CaInjector;
pub use generate::{CaParams, CertGenerator, GeneratedCert, ServingCertParams};
pub use source::{CertificateSource, DirectorySource, SecretSource};
pub use store::{CertState, CertificateStore, InstallOutcome, StoreCertResolver};
pub use watcher::{CertificateWatcher, ReloadOutcome};

use crate::{Error, Result};

/// Build a rustls server config that resolves the certificate from `store`
/// at every handshake.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the protocol versions are not supported by the
/// crypto provider.
pub fn server_config(store: Arc<CertificateStore>) -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("TLS protocol versions: {e}")))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(StoreCertResolver::new(store)));

    // Prefer HTTP/2, fall back to HTTP/1.1
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}
