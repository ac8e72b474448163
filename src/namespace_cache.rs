//! Read-through cache answering "is namespace X in scope".
//!
//! Concurrent lookups of one namespace share a single upstream call: the
//! first caller starts a flight, later callers await the same
//! [`OnceCell`]. Only successful lookups are cached; a missing namespace or
//! an API error yields [`Scope::OutOfScope`] for every caller of that flight
//! and the next request asks again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use snatch_core::Scope;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::metrics;

/// Why a namespace's labels could not be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The namespace does not exist
    #[error("namespace not found")]
    NotFound,
    /// The API server could not answer
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl LookupError {
    fn reason(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Upstream(_) => "upstream",
        }
    }
}

/// Where namespace labels come from.
#[async_trait]
pub trait NamespaceLabelSource: Send + Sync {
    /// Labels of `namespace`.
    async fn labels(&self, namespace: &str) -> Result<BTreeMap<String, String>, LookupError>;
}

/// Reads namespaces from the API server.
#[derive(Clone)]
pub struct KubeNamespaceSource {
    api: Api<Namespace>,
}

impl KubeNamespaceSource {
    /// Create a source using `client`.
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NamespaceLabelSource for KubeNamespaceSource {
    async fn labels(&self, namespace: &str) -> Result<BTreeMap<String, String>, LookupError> {
        match self.api.get_opt(namespace).await {
            Ok(Some(ns)) => Ok(ns.metadata.labels.unwrap_or_default()),
            Ok(None) => Err(LookupError::NotFound),
            Err(e) => Err(LookupError::Upstream(e.to_string())),
        }
    }
}

type Flight = Arc<OnceCell<Result<Scope, LookupError>>>;

#[derive(Default)]
struct Slot {
    cached: Option<(Scope, Instant)>,
    flight: Option<Flight>,
}

/// Cache counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    upstream_lookups: AtomicU64,
}

impl CacheStats {
    /// Answers served from a fresh entry
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Answers that needed (or joined) an upstream call
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Calls made to the label source
    pub fn upstream_lookups(&self) -> u64 {
        self.upstream_lookups.load(Ordering::Relaxed)
    }
}

/// Namespace scope cache with per-namespace single-flight refresh.
pub struct NamespacePolicyCache {
    source: Arc<dyn NamespaceLabelSource>,
    label_key: String,
    label_value: String,
    ttl: Duration,
    slots: DashMap<String, Slot>,
    stats: CacheStats,
}

impl NamespacePolicyCache {
    /// Namespaces are in scope when `label_key=label_value`.
    pub fn new(
        source: Arc<dyn NamespaceLabelSource>,
        label_key: impl Into<String>,
        label_value: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            source,
            label_key: label_key.into(),
            label_value: label_value.into(),
            ttl,
            slots: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Counters for tests and diagnostics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Scope of `namespace`; never fails.
    pub async fn scope(&self, namespace: &str) -> Scope {
        let flight = {
            let mut slot = self.slots.entry(namespace.to_string()).or_default();
            if let Some((scope, fetched_at)) = slot.cached {
                if fetched_at.elapsed() < self.ttl {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::record_namespace_cache("hit");
                    return scope;
                }
            }
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            metrics::record_namespace_cache("miss");
            if let Some(flight) = &slot.flight {
                Arc::clone(flight)
            } else {
                let flight = Flight::default();
                slot.flight = Some(Arc::clone(&flight));
                flight
            }
        };

        // a cancelled initializer hands the flight to the next waiter
        let result = flight
            .get_or_init(|| self.fetch(namespace))
            .await
            .clone();

        if let Some(mut slot) = self.slots.get_mut(namespace) {
            if slot.flight.as_ref().is_some_and(|f| Arc::ptr_eq(f, &flight)) {
                slot.flight = None;
                if let Ok(scope) = result {
                    slot.cached = Some((scope, Instant::now()));
                }
            }
        }

        result.unwrap_or(Scope::OutOfScope)
    }

    async fn fetch(&self, namespace: &str) -> Result<Scope, LookupError> {
        self.stats.upstream_lookups.fetch_add(1, Ordering::Relaxed);
        match self.source.labels(namespace).await {
            Ok(labels) => {
                let scope = Scope::from_labels(&labels, &self.label_key, &self.label_value);
                debug!(namespace, scope = %scope, "Namespace scope refreshed");
                Ok(scope)
            }
            Err(e) => {
                warn!(namespace, error = %e, "Namespace lookup failed, treating as out of scope");
                metrics::record_namespace_lookup_failure(e.reason());
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for NamespacePolicyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacePolicyCache")
            .field("label_key", &self.label_key)
            .field("label_value", &self.label_value)
            .field("ttl", &self.ttl)
            .field("entries", &self.slots.len())
            .finish_non_exhaustive()
    }
}
