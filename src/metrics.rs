//! Metric series emitted by the webhook
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op, so tests and the `tls`/`manifests`
//! subcommands never touch a registry.

use std::time::Duration;

use telemetry_metrics::{counter, gauge, histogram};

/// Admission requests by outcome (`mutated`, `unchanged`, `out_of_scope`,
/// `ignored`, `failed_open`, `rejected`, `bad_request`).
pub const ADMISSION_REQUESTS: &str = "kim_snatch_admission_requests_total";
/// Admission handling latency.
pub const ADMISSION_DURATION: &str = "kim_snatch_admission_duration_seconds";
/// Certificate reload attempts by result.
pub const CERTIFICATE_RELOADS: &str = "kim_snatch_certificate_reloads_total";
/// Generation of the active serving certificate.
pub const CERTIFICATE_GENERATION: &str = "kim_snatch_certificate_generation";
/// Namespace cache lookups by result (`hit`, `miss`).
pub const NAMESPACE_CACHE_REQUESTS: &str = "kim_snatch_namespace_cache_requests_total";
/// Failed namespace lookups by reason (`not_found`, `upstream`).
pub const NAMESPACE_LOOKUP_FAILURES: &str = "kim_snatch_namespace_lookup_failures_total";
/// CA bundle injections by result.
pub const CA_INJECTIONS: &str = "kim_snatch_ca_injections_total";

/// Record one handled admission request.
pub fn record_admission(outcome: &'static str, elapsed: Duration) {
    counter!(ADMISSION_REQUESTS, "outcome" => outcome).increment(1);
    histogram!(ADMISSION_DURATION).record(elapsed.as_secs_f64());
}

/// Record a certificate reload attempt.
pub fn record_certificate_reload(result: &'static str) {
    counter!(CERTIFICATE_RELOADS, "result" => result).increment(1);
}

/// Publish the active certificate generation.
#[allow(clippy::cast_precision_loss)]
pub fn set_certificate_generation(generation: u64) {
    gauge!(CERTIFICATE_GENERATION).set(generation as f64);
}

/// Record a namespace cache lookup.
pub fn record_namespace_cache(result: &'static str) {
    counter!(NAMESPACE_CACHE_REQUESTS, "result" => result).increment(1);
}

/// Record a failed namespace lookup.
pub fn record_namespace_lookup_failure(reason: &'static str) {
    counter!(NAMESPACE_LOOKUP_FAILURES, "reason" => reason).increment(1);
}

/// Record a CA bundle injection attempt.
pub fn record_ca_injection(result: &'static str) {
    counter!(CA_INJECTIONS, "result" => result).increment(1);
}

/// Renders the Prometheus text exposition.
#[derive(Clone)]
pub struct MetricsExporter {
    #[cfg(feature = "metrics")]
    handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl MetricsExporter {
    /// Install the global Prometheus recorder.
    ///
    /// Can only succeed once per process.
    #[cfg(feature = "metrics")]
    pub fn install() -> crate::Result<Self> {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| crate::Error::Internal(format!("metrics recorder: {e}")))?;
        Ok(Self { handle })
    }

    /// Without the `metrics` feature there is nothing to install.
    #[cfg(not(feature = "metrics"))]
    pub fn install() -> crate::Result<Self> {
        Ok(Self {})
    }

    /// Current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        #[cfg(feature = "metrics")]
        {
            self.handle.render()
        }
        #[cfg(not(feature = "metrics"))]
        {
            String::new()
        }
    }
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter").finish_non_exhaustive()
    }
}
