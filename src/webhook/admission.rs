//! `AdmissionReview` handling for Pod creation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde_json::Value;
use snatch_core::{AffinityPolicy, Decision, NoopReason, Scope, decide};
use tracing::{debug, info, warn};

use super::to_json_patch;
use crate::config::FailurePolicy;
use crate::metrics;
use crate::namespace_cache::NamespacePolicyCache;

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Allowed with the affinity patch
    Mutated,
    /// In scope, nothing to add
    Unchanged,
    /// Namespace did not opt in
    OutOfScope,
    /// Not a Pod CREATE
    Ignored,
    /// Could not be handled, allowed unchanged with a warning
    FailedOpen,
    /// Could not be handled, denied under the `fail` policy
    Rejected,
    /// Not a usable `AdmissionReview`
    BadRequest,
}

impl Outcome {
    /// Metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mutated => "mutated",
            Self::Unchanged => "unchanged",
            Self::OutOfScope => "out_of_scope",
            Self::Ignored => "ignored",
            Self::FailedOpen => "failed_open",
            Self::Rejected => "rejected",
            Self::BadRequest => "bad_request",
        }
    }
}

/// The body is not an `AdmissionReview` this webhook can answer.
#[derive(Debug, thiserror::Error)]
#[error("invalid AdmissionReview: {0}")]
pub struct BadReview(pub String);

/// Turns `AdmissionReview` requests into responses.
pub struct AdmissionHandler {
    cache: Arc<NamespacePolicyCache>,
    policy: AffinityPolicy,
    failure_policy: FailurePolicy,
    deadline: Duration,
}

impl AdmissionHandler {
    /// Create a handler.
    pub fn new(
        cache: Arc<NamespacePolicyCache>,
        policy: AffinityPolicy,
        failure_policy: FailurePolicy,
        deadline: Duration,
    ) -> Self {
        Self {
            cache,
            policy,
            failure_policy,
            deadline,
        }
    }

    /// Answer one request body. Records one metric observation.
    ///
    /// # Errors
    ///
    /// Returns [`BadReview`] for malformed JSON, a missing request or an
    /// empty request UID; the caller answers those with HTTP 400.
    pub async fn handle(&self, body: &[u8]) -> Result<AdmissionReview<DynamicObject>, BadReview> {
        let started = Instant::now();
        let result = self.review(body).await;
        let outcome = match &result {
            Ok((_, outcome)) => *outcome,
            Err(_) => Outcome::BadRequest,
        };
        metrics::record_admission(outcome.as_str(), started.elapsed());
        result.map(|(response, _)| response.into_review())
    }

    async fn review(&self, body: &[u8]) -> Result<(AdmissionResponse, Outcome), BadReview> {
        let (request, object) = parse_review(body)?;
        let uid = request.uid.clone();

        if request.operation != Operation::Create || !is_core_v1_pod(&request) {
            debug!(
                uid = %uid,
                operation = ?request.operation,
                kind = %request.kind.kind,
                "Not a Pod CREATE, allowing unchanged"
            );
            return Ok((AdmissionResponse::from(&request), Outcome::Ignored));
        }

        let evaluated =
            tokio::time::timeout(self.deadline, self.evaluate(&request, object)).await;
        let (response, outcome) = match evaluated {
            Ok(answer) => answer,
            Err(_) => self.fail(
                &request,
                format!("admission deadline of {:?} exceeded", self.deadline),
            ),
        };

        info!(
            uid = %uid,
            namespace = ?request.namespace,
            outcome = outcome.as_str(),
            "Admission request handled"
        );
        Ok((response, outcome))
    }

    async fn evaluate(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        object: Option<Value>,
    ) -> (AdmissionResponse, Outcome) {
        let Some(object) = object.filter(|o| !o.is_null()) else {
            return self.fail(request, "request carries no Pod object".to_string());
        };
        let pod: Pod = match serde_json::from_value(object) {
            Ok(pod) => pod,
            Err(e) => return self.fail(request, format!("cannot decode Pod: {e}")),
        };

        let namespace = request
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| pod.metadata.namespace.clone());
        let scope = match namespace.as_deref() {
            Some(ns) => self.cache.scope(ns).await,
            None => Scope::OutOfScope,
        };

        let decision = decide(&pod, scope, &self.policy);
        let ops = match decision.to_operations() {
            Ok(Some(ops)) => ops,
            Ok(None) => {
                let outcome = match &decision {
                    Decision::Noop(NoopReason::OutOfScope) => Outcome::OutOfScope,
                    Decision::Noop(reason) => {
                        debug!(uid = %request.uid, reason = reason.as_str(), "No mutation");
                        Outcome::Unchanged
                    }
                    Decision::Inject(_) => Outcome::Unchanged,
                };
                return (AdmissionResponse::from(request), outcome);
            }
            Err(e) => return self.fail(request, format!("cannot encode patch: {e}")),
        };

        let patched = to_json_patch(&ops)
            .map_err(|e| e.to_string())
            .and_then(|patch| {
                AdmissionResponse::from(request)
                    .with_patch(patch)
                    .map_err(|e| e.to_string())
            });
        match patched {
            Ok(response) => (response, Outcome::Mutated),
            Err(e) => self.fail(request, format!("cannot encode patch: {e}")),
        }
    }

    /// Answer a request that could not be evaluated, per the failure policy.
    fn fail(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        message: String,
    ) -> (AdmissionResponse, Outcome) {
        warn!(
            uid = %request.uid,
            error = %message,
            policy = ?self.failure_policy,
            "Admission evaluation failed"
        );
        match self.failure_policy {
            FailurePolicy::Ignore => {
                let mut response = AdmissionResponse::from(request);
                response.warnings =
                    Some(vec![format!("kim-snatch: {message}; Pod admitted unchanged")]);
                (response, Outcome::FailedOpen)
            }
            FailurePolicy::Fail => (
                AdmissionResponse::from(request).deny(format!("kim-snatch: {message}")),
                Outcome::Rejected,
            ),
        }
    }
}

impl std::fmt::Debug for AdmissionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionHandler")
            .field("policy", &self.policy)
            .field("failure_policy", &self.failure_policy)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Split a body into the request envelope and its raw embedded object.
///
/// The object is detached before typed decoding so an undecodable Pod does
/// not turn the whole review into a bad request.
fn parse_review(
    body: &[u8],
) -> Result<(AdmissionRequest<DynamicObject>, Option<Value>), BadReview> {
    let mut raw: Value =
        serde_json::from_slice(body).map_err(|e| BadReview(format!("malformed JSON: {e}")))?;
    let object = raw.pointer_mut("/request/object").map(Value::take);

    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(raw).map_err(|e| BadReview(e.to_string()))?;
    let request: AdmissionRequest<DynamicObject> =
        review.try_into().map_err(|e| BadReview(format!("{e}")))?;

    if request.uid.is_empty() {
        return Err(BadReview("request uid is empty".into()));
    }
    Ok((request, object))
}

fn is_core_v1_pod(request: &AdmissionRequest<DynamicObject>) -> bool {
    request.kind.group.is_empty() && request.kind.version == "v1" && request.kind.kind == "Pod"
}
