//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use snatch_core::{AffinityPolicy, MANAGED_BY_LABEL, MANAGED_BY_VALUE, WORKER_POOL_LABEL};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Webhook server configuration
    pub server: ServerConfig,
    /// Metrics server configuration
    pub metrics: MetricsConfig,
    /// Serving certificate configuration
    pub tls: TlsConfig,
    /// Mutation policy
    pub policy: PolicyConfig,
    /// Namespace label cache
    pub namespace_cache: NamespaceCacheConfig,
    /// CA bundle injection into the webhook configuration
    pub ca_injection: CaInjectionConfig,
    /// PriorityClass the controller workload declares
    pub priority_class_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            metrics: MetricsConfig::default(),
            tls: TlsConfig::default(),
            policy: PolicyConfig::default(),
            namespace_cache: NamespaceCacheConfig::default(),
            ca_injection: CaInjectionConfig::default(),
            priority_class_name: "kim-snatch-priority-class".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (KIM_SNATCH_ prefix)
        figment = figment.merge(Env::prefixed("KIM_SNATCH_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(config)
    }

    /// Check values that deserialize fine but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.policy.worker_pool.trim().is_empty() {
            return Err(Error::Config("policy.worker_pool must not be empty".into()));
        }
        if !(1..=100).contains(&self.policy.weight) {
            return Err(Error::Config(format!(
                "policy.weight must be within 1..=100, got {}",
                self.policy.weight
            )));
        }
        if self.server.admission_deadline.is_zero() {
            return Err(Error::Config(
                "server.admission_deadline must be greater than zero".into(),
            ));
        }
        if self.tls.poll_interval.is_zero() {
            return Err(Error::Config(
                "tls.poll_interval must be greater than zero".into(),
            ));
        }
        if !self.server.webhook_path.starts_with('/') {
            return Err(Error::Config(format!(
                "server.webhook_path must start with '/', got '{}'",
                self.server.webhook_path
            )));
        }
        if let TlsSourceConfig::Secret { name, .. } = &self.tls.source {
            if name.is_empty() {
                return Err(Error::Config("tls.source.name must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Webhook server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Path the API server posts `AdmissionReview`s to
    pub webhook_path: String,
    /// Budget for answering one admission request
    #[serde(with = "humantime_serde")]
    pub admission_deadline: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9443,
            webhook_path: "/mutate--v1-pod".to_string(),
            admission_deadline: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 3 * 1024 * 1024,
        }
    }
}

/// Metrics server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve metrics
    pub enabled: bool,
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Scrape path
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/metrics".to_string(),
        }
    }
}

/// Serving certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Where the certificate material comes from
    pub source: TlsSourceConfig,
    /// Interval between source fingerprint checks
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Quiet period after a file-system event before reloading
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
    /// How long startup waits for the first valid certificate
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            source: TlsSourceConfig::default(),
            poll_interval: Duration::from_secs(10),
            debounce: Duration::from_millis(500),
            startup_timeout: Duration::from_secs(60),
        }
    }
}

/// Certificate source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TlsSourceConfig {
    /// PEM files in a directory (a mounted secret)
    Directory {
        /// Directory holding the files
        cert_dir: String,
        /// Certificate chain file name
        #[serde(default = "default_cert_file")]
        cert_file: String,
        /// Private key file name
        #[serde(default = "default_key_file")]
        key_file: String,
        /// CA certificate file name
        #[serde(default = "default_ca_file")]
        ca_file: String,
    },
    /// A `kubernetes.io/tls` secret read through the API server
    Secret {
        /// Secret namespace
        namespace: String,
        /// Secret name
        name: String,
    },
}

fn default_cert_file() -> String {
    "tls.crt".to_string()
}

fn default_key_file() -> String {
    "tls.key".to_string()
}

fn default_ca_file() -> String {
    "ca.crt".to_string()
}

impl Default for TlsSourceConfig {
    fn default() -> Self {
        Self::Directory {
            cert_dir: "/tmp/k8s-webhook-server/serving-certs".to_string(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            ca_file: default_ca_file(),
        }
    }
}

/// Behaviour when a request cannot be handled confidently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit unchanged (fail open)
    #[default]
    Ignore,
    /// Reject the object (fail closed)
    Fail,
}

/// Required-affinity handling, mirrors [`snatch_core::RequiredAffinityPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAffinityMode {
    /// Add the preference next to required terms
    #[default]
    Inject,
    /// Leave Pods with required terms untouched
    Skip,
}

/// Mutation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Namespace label key that opts a namespace in
    pub namespace_label_key: String,
    /// Namespace label value that opts a namespace in
    pub namespace_label_value: String,
    /// Node label identifying worker pools
    pub pool_label_key: String,
    /// Worker pool Pods are steered to
    pub worker_pool: String,
    /// Preference weight (1..=100)
    pub weight: i32,
    /// Pods with required but no preferred node affinity
    pub required_affinity: RequiredAffinityMode,
    /// Decode failures and deadline expiry
    pub failure_policy: FailurePolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            namespace_label_key: MANAGED_BY_LABEL.to_string(),
            namespace_label_value: MANAGED_BY_VALUE.to_string(),
            pool_label_key: WORKER_POOL_LABEL.to_string(),
            worker_pool: "kyma".to_string(),
            weight: 1,
            required_affinity: RequiredAffinityMode::Inject,
            failure_policy: FailurePolicy::Ignore,
        }
    }
}

impl PolicyConfig {
    /// The affinity policy handed to the mutation engine.
    #[must_use]
    pub fn affinity_policy(&self) -> AffinityPolicy {
        AffinityPolicy {
            pool_label_key: self.pool_label_key.clone(),
            pool: self.worker_pool.clone(),
            weight: self.weight,
            required_affinity: match self.required_affinity {
                RequiredAffinityMode::Inject => snatch_core::RequiredAffinityPolicy::Inject,
                RequiredAffinityMode::Skip => snatch_core::RequiredAffinityPolicy::Skip,
            },
        }
    }
}

/// Namespace label cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceCacheConfig {
    /// Freshness window of a cached namespace verdict
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for NamespaceCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
        }
    }
}

/// CA bundle injection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaInjectionConfig {
    /// Write the active CA into the webhook configuration after each rotation.
    /// Off by default: cert-manager's CA injector normally owns this field.
    pub enabled: bool,
    /// `MutatingWebhookConfiguration` to update
    pub webhook_configuration: String,
}

impl Default for CaInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_configuration: "kim-snatch-mutating-webhook-configuration".to_string(),
        }
    }
}

/// Human-readable serde codec for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (`"500ms"`, `"30s"`)
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string (`"30s"`, `"5m"`, `"100ms"`)
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed input or a value that overflows.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before "s"
        if let Some(ms) = s.strip_suffix("ms") {
            return parse_u64(ms).map(Duration::from_millis);
        }
        let (digits, unit_secs) = if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        parse_u64(digits)?
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    }

    fn parse_u64(digits: &str) -> Result<u64, String> {
        digits
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{digits}': {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_kyma_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.policy.namespace_label_key, "operator.kyma-project.io/managed-by");
        assert_eq!(cfg.policy.namespace_label_value, "kyma");
        assert_eq!(cfg.policy.pool_label_key, "worker.gardener.cloud/pool");
        assert_eq!(cfg.server.port, 9443);
        assert_eq!(cfg.metrics.port, 8080);
        assert!(!cfg.ca_injection.enabled);
    }

    #[test]
    fn default_config_validates() {
        let cfg = Config::default();
        assert_eq!(cfg.priority_class_name, "kim-snatch-priority-class");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_pool_is_rejected() {
        let mut cfg = Config::default();
        cfg.policy.worker_pool = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn weight_out_of_range_is_rejected() {
        let mut cfg = Config::default();
        cfg.policy.weight = 0;
        assert!(cfg.validate().is_err());
        cfg.policy.weight = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
server:
  admission_deadline: 750ms
policy:
  worker_pool: kim-snatch-test
  required_affinity: skip
tls:
  source:
    kind: secret
    namespace: kyma-system
    name: kim-snatch-certificates
"#
        )
        .unwrap();
        drop(f);

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.server.admission_deadline, Duration::from_millis(750));
        assert_eq!(cfg.policy.worker_pool, "kim-snatch-test");
        assert_eq!(cfg.policy.required_affinity, RequiredAffinityMode::Skip);
        assert!(matches!(
            cfg.tls.source,
            TlsSourceConfig::Secret { ref name, .. } if name == "kim-snatch-certificates"
        ));
        // untouched sections keep defaults
        assert_eq!(cfg.server.port, 9443);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/kim-snatch.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn directory_source_file_names_default() {
        let yaml = "kind: directory\ncert_dir: /certs";
        let src: TlsSourceConfig = serde_yaml::from_str(yaml).unwrap();
        match src {
            TlsSourceConfig::Directory {
                cert_file, key_file, ca_file, ..
            } => {
                assert_eq!(cert_file, "tls.crt");
                assert_eq!(key_file, "tls.key");
                assert_eq!(ca_file, "ca.crt");
            }
            TlsSourceConfig::Secret { .. } => panic!("expected directory source"),
        }
    }

    #[test]
    fn durations_parse_all_units() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(humantime_serde::parse("7").unwrap(), Duration::from_secs(7));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let err = humantime_serde::parse("18446744073709551615h").unwrap_err();
        assert!(err.contains("too large"), "{err}");
        assert!(humantime_serde::parse("99999999999999999999s").is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut cfg = Config::default();
        cfg.tls.poll_interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tls.poll_interval"), "{err}");
    }

    #[test]
    fn affinity_policy_carries_policy_values() {
        let mut cfg = PolicyConfig::default();
        cfg.worker_pool = "kim-snatch-test".into();
        cfg.weight = 10;
        let p = cfg.affinity_policy();
        assert_eq!(p.pool, "kim-snatch-test");
        assert_eq!(p.weight, 10);
        assert_eq!(p.pool_label_key, "worker.gardener.cloud/pool");
    }
}
