//! Where serving certificate material comes from.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use super::bundle::CertificateMaterial;
use crate::config::TlsSourceConfig;
use crate::{Error, Result};

/// Secret / file key of the certificate chain.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret / file key of the private key.
pub const TLS_KEY_KEY: &str = "tls.key";
/// Secret / file key of the CA certificate.
pub const CA_CERT_KEY: &str = "ca.crt";

/// A readable origin of certificate material.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// Human-readable location for logs.
    fn describe(&self) -> String;

    /// Read the current material.
    async fn load(&self) -> Result<CertificateMaterial>;

    /// Directory to watch for file-system events, if the source lives on disk.
    fn watch_dir(&self) -> Option<&Path> {
        None
    }
}

/// Build the source named by the configuration.
///
/// # Errors
///
/// Returns an error if a secret source is configured and no Kubernetes client
/// can be created.
pub async fn from_config(config: &TlsSourceConfig) -> Result<Box<dyn CertificateSource>> {
    Ok(match config {
        TlsSourceConfig::Directory {
            cert_dir,
            cert_file,
            key_file,
            ca_file,
        } => Box::new(
            DirectorySource::new(cert_dir).with_file_names(cert_file, key_file, ca_file),
        ),
        TlsSourceConfig::Secret { namespace, name } => {
            let client = Client::try_default().await?;
            Box::new(SecretSource::new(client, namespace, name))
        }
    })
}

/// PEM files in one directory, typically a mounted `kubernetes.io/tls` secret.
///
/// Kubelet updates such mounts by swapping a `..data` symlink, so all three
/// files change in one step.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    cert_file: String,
    key_file: String,
    ca_file: String,
}

impl DirectorySource {
    /// Read `tls.crt`, `tls.key` and `ca.crt` from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cert_file: TLS_CERT_KEY.to_string(),
            key_file: TLS_KEY_KEY.to_string(),
            ca_file: CA_CERT_KEY.to_string(),
        }
    }

    /// Override the file names.
    #[must_use]
    pub fn with_file_names(mut self, cert: &str, key: &str, ca: &str) -> Self {
        self.cert_file = cert.to_string();
        self.key_file = key.to_string();
        self.ca_file = ca.to_string();
        self
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(name);
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Certificate(format!("Cannot read '{}': {e}", path.display())))
    }
}

#[async_trait]
impl CertificateSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }

    async fn load(&self) -> Result<CertificateMaterial> {
        let cert_pem = self.read(&self.cert_file).await?;
        let key_pem = self.read(&self.key_file).await?;
        let ca_pem = match tokio::fs::read(self.dir.join(&self.ca_file)).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(CertificateMaterial {
            cert_pem,
            key_pem,
            ca_pem,
        })
    }

    fn watch_dir(&self) -> Option<&Path> {
        Some(&self.dir)
    }
}

/// A `kubernetes.io/tls` secret read through the API server.
#[derive(Clone)]
pub struct SecretSource {
    api: Api<Secret>,
    namespace: String,
    name: String,
}

impl SecretSource {
    /// Read secret `namespace/name`.
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl CertificateSource for SecretSource {
    fn describe(&self) -> String {
        format!("secret {}/{}", self.namespace, self.name)
    }

    async fn load(&self) -> Result<CertificateMaterial> {
        let secret = self.api.get_opt(&self.name).await?.ok_or_else(|| {
            Error::Certificate(format!("secret {}/{} not found", self.namespace, self.name))
        })?;
        material_from_secret(&secret)
    }
}

/// Extract the three well-known entries from a secret.
///
/// # Errors
///
/// Returns [`Error::Certificate`] if `tls.crt` or `tls.key` is missing.
pub fn material_from_secret(secret: &Secret) -> Result<CertificateMaterial> {
    let data = secret.data.as_ref();
    let entry = |key: &str| data.and_then(|d| d.get(key)).map(|v| v.0.clone());
    let name = secret.metadata.name.as_deref().unwrap_or_default();

    let cert_pem = entry(TLS_CERT_KEY)
        .ok_or_else(|| Error::Certificate(format!("secret {name} has no {TLS_CERT_KEY}")))?;
    let key_pem = entry(TLS_KEY_KEY)
        .ok_or_else(|| Error::Certificate(format!("secret {name} has no {TLS_KEY_KEY}")))?;
    let ca_pem = entry(CA_CERT_KEY).filter(|ca| !ca.is_empty());

    Ok(CertificateMaterial {
        cert_pem,
        key_pem,
        ca_pem,
    })
}
