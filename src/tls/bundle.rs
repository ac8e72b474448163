//! Validated serving certificate material.
//!
//! A [`CertificateBundle`] is only ever constructed from material that
//! passed [`CertificateBundle::validate`]: the private key matches the leaf
//! certificate, the leaf is inside its validity window, and the CA (when
//! present) parses. Bundles are immutable once built and shared as `Arc`s.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Raw PEM material as delivered by a certificate source.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    /// `tls.crt`: leaf certificate followed by any intermediates
    pub cert_pem: Vec<u8>,
    /// `tls.key`
    pub key_pem: Vec<u8>,
    /// `ca.crt`, absent when the source does not provide one
    pub ca_pem: Option<Vec<u8>>,
}

impl CertificateMaterial {
    /// SHA-256 over all three entries, hex encoded.
    ///
    /// Entries are length-prefixed so moving bytes between them changes the
    /// fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            Some(self.cert_pem.as_slice()),
            Some(self.key_pem.as_slice()),
            self.ca_pem.as_deref(),
        ] {
            match part {
                Some(bytes) => {
                    hasher.update((bytes.len() as u64).to_be_bytes());
                    hasher.update(bytes);
                }
                None => hasher.update(u64::MAX.to_be_bytes()),
            }
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print key bytes
        f.debug_struct("CertificateMaterial")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem_len", &self.key_pem.len())
            .field("ca_pem_len", &self.ca_pem.as_ref().map(Vec::len))
            .finish()
    }
}

/// Validated certificate, key and CA.
pub struct CertificateBundle {
    material: CertificateMaterial,
    certified_key: Arc<CertifiedKey>,
    fingerprint: String,
    not_after: i64,
    generation: u64,
}

impl CertificateBundle {
    /// Validate raw material into a bundle.
    ///
    /// The returned bundle has generation 0 until a store activates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Certificate`] if the chain or key do not parse, the key
    /// does not belong to the leaf certificate, the leaf is expired or not yet
    /// valid, or the CA does not parse.
    pub fn validate(material: CertificateMaterial) -> Result<Self> {
        let chain = parse_certificates(&material.cert_pem, "tls.crt")?;
        let key = PrivateKeyDer::from_pem_slice(&material.key_pem)
            .map_err(|e| Error::Certificate(format!("tls.key: {e}")))?;

        let signing_key = any_supported_type(&key)
            .map_err(|e| Error::Certificate(format!("tls.key: unsupported key: {e}")))?;

        let (not_before, not_after) = validity_window(&chain[0])?;
        let now = unix_now();
        if now < not_before {
            return Err(Error::Certificate(format!(
                "tls.crt: certificate not valid before {not_before}"
            )));
        }
        if now > not_after {
            return Err(Error::Certificate(format!(
                "tls.crt: certificate expired at {not_after}"
            )));
        }

        let certified_key = CertifiedKey::new(chain, signing_key);
        certified_key
            .keys_match()
            .map_err(|e| Error::Certificate(format!("tls.key does not match tls.crt: {e}")))?;

        if let Some(ca) = material.ca_pem.as_deref() {
            for cert in parse_certificates(ca, "ca.crt")? {
                x509_parser::parse_x509_certificate(&cert)
                    .map_err(|e| Error::Certificate(format!("ca.crt: {e}")))?;
            }
        }

        let fingerprint = material.fingerprint();
        Ok(Self {
            material,
            certified_key: Arc::new(certified_key),
            fingerprint,
            not_after,
            generation: 0,
        })
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Chain and signing key for the TLS handshake.
    #[must_use]
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// Identity of the underlying material.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Store-assigned generation, strictly increasing across activations.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Leaf expiry as a unix timestamp.
    #[must_use]
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    /// PEM CA bundle, if the source delivered one.
    #[must_use]
    pub fn ca_pem(&self) -> Option<&[u8]> {
        self.material.ca_pem.as_deref()
    }

    /// The raw material this bundle was built from.
    #[must_use]
    pub fn material(&self) -> &CertificateMaterial {
        &self.material
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("fingerprint", &self.fingerprint)
            .field("generation", &self.generation)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn parse_certificates(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Certificate(format!("{what}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Certificate(format!("{what}: no certificates found")));
    }
    Ok(certs)
}

fn validity_window(leaf: &CertificateDer<'_>) -> Result<(i64, i64)> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf)
        .map_err(|e| Error::Certificate(format!("tls.crt: {e}")))?;
    let validity = cert.validity();
    Ok((validity.not_before.timestamp(), validity.not_after.timestamp()))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::generate::{CaParams, CertGenerator, ServingCertParams};

    fn material() -> CertificateMaterial {
        let ca = CertGenerator::init_ca(&CaParams {
            cn: "test CA",
            validity_days: 30,
        })
        .unwrap();
        let leaf = CertGenerator::issue_serving(
            &ServingCertParams {
                san_dns: vec!["kim-snatch-webhook-service.kyma-system.svc".into()],
                validity_days: 30,
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();
        CertificateMaterial {
            cert_pem: leaf.cert_pem.into_bytes(),
            key_pem: leaf.key_pem.into_bytes(),
            ca_pem: Some(ca.cert_pem.into_bytes()),
        }
    }

    #[test]
    fn matching_pair_validates() {
        // GIVEN: a freshly issued serving certificate
        let m = material();
        let fp = m.fingerprint();
        // WHEN: validating
        let bundle = CertificateBundle::validate(m).unwrap();
        // THEN: fingerprint is the material's, generation unassigned
        assert_eq!(bundle.fingerprint(), fp);
        assert_eq!(bundle.generation(), 0);
        assert!(bundle.ca_pem().is_some());
    }

    #[test]
    fn mismatched_key_is_rejected() {
        // GIVEN: the certificate of one issuance and the key of another
        let a = material();
        let b = material();
        let torn = CertificateMaterial {
            cert_pem: a.cert_pem,
            key_pem: b.key_pem,
            ca_pem: a.ca_pem,
        };
        // WHEN / THEN
        let err = CertificateBundle::validate(torn).unwrap_err();
        assert!(err.to_string().contains("does not match"), "{err}");
    }

    #[test]
    fn garbage_ca_is_rejected() {
        let mut m = material();
        m.ca_pem = Some(b"not a certificate".to_vec());
        assert!(CertificateBundle::validate(m).is_err());
    }

    #[test]
    fn missing_ca_is_allowed() {
        let mut m = material();
        m.ca_pem = None;
        assert!(CertificateBundle::validate(m).is_ok());
    }

    #[test]
    fn empty_certificate_is_rejected() {
        let mut m = material();
        m.cert_pem.clear();
        let err = CertificateBundle::validate(m).unwrap_err();
        assert!(err.to_string().contains("no certificates"), "{err}");
    }

    #[test]
    fn fingerprint_distinguishes_entry_boundaries() {
        let a = CertificateMaterial {
            cert_pem: b"ab".to_vec(),
            key_pem: b"c".to_vec(),
            ca_pem: None,
        };
        let b = CertificateMaterial {
            cert_pem: b"a".to_vec(),
            key_pem: b"bc".to_vec(),
            ca_pem: None,
        };
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }

    #[test]
    fn debug_never_prints_key_material() {
        let m = material();
        let out = format!("{m:?}");
        assert!(!out.contains("PRIVATE KEY"));
    }
}
