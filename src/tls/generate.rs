//! Certificate generation for the `kim-snatch tls` subcommands and tests.
//!
//! Produces a self-signed CA and serving certificates for the webhook
//! Service without `openssl` or cert-manager. Output is PEM.

use std::fs;
use std::path::Path;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, date_time_ymd,
};

use crate::{Error, Result};

/// Parameters for generating a CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name of the CA.
    pub cn: &'a str,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Parameters for a webhook serving certificate.
#[derive(Debug)]
pub struct ServingCertParams {
    /// DNS names the API server dials, e.g. `<service>.<namespace>.svc`.
    /// The first entry doubles as the Common Name.
    pub san_dns: Vec<String>,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Generated certificate and key pair in PEM format.
#[derive(Debug)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Certificate generator backed by `rcgen`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or signing fails.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("Failed to generate CA key: {e}")))?;

        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn);
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        ca_params.not_after = validity_to_date(params.validity_days)?;

        let ca_cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| Error::Certificate(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: ca_cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Issue a serving certificate signed by `ca_cert_pem` / `ca_key_pem`.
    ///
    /// # Errors
    ///
    /// Returns an error if no SAN is given, a SAN is not a valid DNS name, the
    /// CA cannot be parsed, or signing fails.
    pub fn issue_serving(
        params: &ServingCertParams,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let Some(cn) = params.san_dns.first() else {
            return Err(Error::Certificate(
                "serving certificate needs at least one DNS name".into(),
            ));
        };

        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, &ca_key)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA cert: {e}")))?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("Failed to generate serving key: {e}")))?;

        let mut leaf_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn.as_str());
        leaf_params.distinguished_name = dn;
        leaf_params.is_ca = IsCa::NoCa;
        leaf_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        leaf_params.not_after = validity_to_date(params.validity_days)?;
        leaf_params.subject_alt_names = params
            .san_dns
            .iter()
            .map(|dns| {
                Ia5String::try_from(dns.as_str())
                    .map(SanType::DnsName)
                    .map_err(|e| Error::Certificate(format!("Invalid DNS SAN '{dns}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::Certificate(format!("Serving cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Write `<stem>.crt` and `<stem>.key` under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the files
    /// cannot be written.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)?;
        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)?;
        Ok(())
    }
}

/// A date `days` from now, at day granularity.
fn validity_to_date(days: u32) -> Result<time::OffsetDateTime> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Internal(format!("System time error: {e}")))?
        .as_secs();

    let future_secs = now_secs.saturating_add(u64::from(days) * 86_400);

    let dt = time::OffsetDateTime::from_unix_timestamp(
        i64::try_from(future_secs).unwrap_or(i64::MAX),
    )
    .map_err(|e| Error::Internal(format!("Date calculation error: {e}")))?;

    Ok(date_time_ymd(dt.year(), dt.month() as u8, dt.day()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::CertificateDer;
    use rustls::pki_types::pem::PemObject;

    fn ca() -> GeneratedCert {
        CertGenerator::init_ca(&CaParams {
            cn: "kim-snatch test CA",
            validity_days: 365,
        })
        .unwrap()
    }

    #[test]
    fn init_ca_produces_pem_cert_and_key() {
        let ca = ca();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn serving_cert_carries_all_sans() {
        // GIVEN: a CA and two service DNS names
        let ca = ca();
        let params = ServingCertParams {
            san_dns: vec![
                "kim-snatch-webhook-service.kyma-system.svc".into(),
                "kim-snatch-webhook-service.kyma-system.svc.cluster.local".into(),
            ],
            validity_days: 30,
        };
        // WHEN: issuing
        let leaf = CertGenerator::issue_serving(&params, &ca.cert_pem, &ca.key_pem).unwrap();
        // THEN: both names are in the SAN extension
        let der = CertificateDer::from_pem_slice(leaf.cert_pem.as_bytes()).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(&der).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert_eq!(san.value.general_names.len(), 2);
    }

    #[test]
    fn serving_cert_without_sans_is_rejected() {
        let ca = ca();
        let params = ServingCertParams {
            san_dns: vec![],
            validity_days: 30,
        };
        assert!(CertGenerator::issue_serving(&params, &ca.cert_pem, &ca.key_pem).is_err());
    }

    #[test]
    fn write_to_dir_creates_crt_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca();
        CertGenerator::write_to_dir(&ca, dir.path(), "ca").unwrap();
        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("ca.key").exists());
    }
}
