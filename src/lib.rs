//! kim-snatch
//!
//! Mutating admission webhook that steers Pods of Kyma-managed namespaces to a
//! dedicated Gardener worker pool.
//!
//! # Features
//!
//! - **Pod mutation**: preferred node affinity for `worker.gardener.cloud/pool`,
//!   injected only where the Pod expresses no preference of its own
//! - **Namespace scoping**: single-flight, TTL-bounded namespace label cache
//! - **Certificate rotation**: serving certificates hot-swapped per handshake
//!   without dropping connections or the listener
//! - **Fail open**: no admission request blocks beyond its deadline
//! - **Observability**: Prometheus metrics, health and readiness probes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod manifests;
pub mod metrics;
pub mod namespace_cache;
pub mod tls;
pub mod webhook;

pub use error::{Error, Result};
pub use snatch_core;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        _ => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
    }

    Ok(())
}
