//! Node-affinity mutation decision.
//!
//! [`decide`] inspects a Pod and a [`Scope`] verdict and either returns the
//! single patch that adds a preferred node-affinity term for the configured
//! worker pool, or explains why nothing is done. Injection is additive only:
//! an existing preferred term list is never touched.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PreferredSchedulingTerm,
};

use crate::WORKER_POOL_LABEL;
use crate::patch::{PatchOperation, PatchPath};
use crate::scope::Scope;

const PREFERRED_FIELD: &str = "preferredDuringSchedulingIgnoredDuringExecution";

/// What to do when a Pod already has a *required* node-affinity term but no
/// preferred one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredAffinityPolicy {
    /// Add the preferred term next to the required one.
    #[default]
    Inject,
    /// Treat any existing node affinity as user intent and leave the Pod alone.
    Skip,
}

/// The preference injected into in-scope Pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityPolicy {
    /// Node label identifying the pool (`worker.gardener.cloud/pool`).
    pub pool_label_key: String,
    /// Pool the Pods are steered to.
    pub pool: String,
    /// Scheduling weight of the preference, 1..=100.
    pub weight: i32,
    /// Behaviour for Pods that only declare required node affinity.
    pub required_affinity: RequiredAffinityPolicy,
}

impl AffinityPolicy {
    /// Policy for `pool` with the Gardener pool label and weight 1.
    pub fn for_pool(pool: impl Into<String>) -> Self {
        Self {
            pool_label_key: WORKER_POOL_LABEL.to_string(),
            pool: pool.into(),
            weight: 1,
            required_affinity: RequiredAffinityPolicy::Inject,
        }
    }

    /// The preferred scheduling term this policy injects.
    #[must_use]
    pub fn preferred_term(&self) -> PreferredSchedulingTerm {
        PreferredSchedulingTerm {
            weight: self.weight,
            preference: NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: self.pool_label_key.clone(),
                    operator: "In".to_string(),
                    values: Some(vec![self.pool.clone()]),
                }]),
                match_fields: None,
            },
        }
    }
}

/// Why a Pod is admitted without a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoopReason {
    /// The namespace did not opt in.
    OutOfScope,
    /// The Pod has no `spec` to attach affinity to.
    MissingSpec,
    /// The Pod already declares preferred node affinity.
    PreferredAffinityPresent,
    /// The Pod declares required node affinity and the policy is
    /// [`RequiredAffinityPolicy::Skip`].
    RequiredAffinityPresent,
}

impl NoopReason {
    /// Short label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutOfScope => "out_of_scope",
            Self::MissingSpec => "missing_spec",
            Self::PreferredAffinityPresent => "preferred_affinity_present",
            Self::RequiredAffinityPresent => "required_affinity_present",
        }
    }
}

/// The deepest missing level of `spec.affinity.nodeAffinity.preferred…`,
/// together with the typed value that fills it.
#[derive(Debug, Clone, PartialEq)]
pub enum AffinityInjection {
    /// `spec.affinity` is absent.
    Affinity(Affinity),
    /// `spec.affinity` exists, `nodeAffinity` does not.
    NodeAffinity(NodeAffinity),
    /// `nodeAffinity` exists without preferred terms.
    PreferredTerms(Vec<PreferredSchedulingTerm>),
}

impl AffinityInjection {
    /// Location the value is added at.
    #[must_use]
    pub fn path(&self) -> PatchPath {
        match self {
            Self::Affinity(_) => PatchPath::new(["spec", "affinity"]),
            Self::NodeAffinity(_) => PatchPath::new(["spec", "affinity", "nodeAffinity"]),
            Self::PreferredTerms(_) => {
                PatchPath::new(["spec", "affinity", "nodeAffinity", PREFERRED_FIELD])
            }
        }
    }

    /// Serialize into the single `add` operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the typed value cannot be serialized.
    pub fn to_operation(&self) -> serde_json::Result<PatchOperation> {
        let value = match self {
            Self::Affinity(a) => serde_json::to_value(a)?,
            Self::NodeAffinity(n) => serde_json::to_value(n)?,
            Self::PreferredTerms(t) => serde_json::to_value(t)?,
        };
        Ok(PatchOperation::Add {
            path: self.path(),
            value,
        })
    }
}

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Add the preference.
    Inject(AffinityInjection),
    /// Admit unchanged.
    Noop(NoopReason),
}

impl Decision {
    /// `true` when the decision carries a patch.
    #[must_use]
    pub fn is_inject(&self) -> bool {
        matches!(self, Self::Inject(_))
    }

    /// The JSON-patch operations for this decision; `None` for a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the injected value cannot be serialized.
    pub fn to_operations(&self) -> serde_json::Result<Option<Vec<PatchOperation>>> {
        match self {
            Self::Inject(injection) => Ok(Some(vec![injection.to_operation()?])),
            Self::Noop(_) => Ok(None),
        }
    }
}

/// Decide whether `pod` gets the pool preference.
#[must_use]
pub fn decide(pod: &Pod, scope: Scope, policy: &AffinityPolicy) -> Decision {
    if !scope.is_in_scope() {
        return Decision::Noop(NoopReason::OutOfScope);
    }
    let Some(spec) = pod.spec.as_ref() else {
        return Decision::Noop(NoopReason::MissingSpec);
    };

    let term = policy.preferred_term();
    let Some(affinity) = spec.affinity.as_ref() else {
        return Decision::Inject(AffinityInjection::Affinity(Affinity {
            node_affinity: Some(NodeAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(vec![term]),
                required_during_scheduling_ignored_during_execution: None,
            }),
            ..Affinity::default()
        }));
    };
    let Some(node_affinity) = affinity.node_affinity.as_ref() else {
        return Decision::Inject(AffinityInjection::NodeAffinity(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![term]),
            required_during_scheduling_ignored_during_execution: None,
        }));
    };

    let has_preferred = node_affinity
        .preferred_during_scheduling_ignored_during_execution
        .as_ref()
        .is_some_and(|terms| !terms.is_empty());
    if has_preferred {
        return Decision::Noop(NoopReason::PreferredAffinityPresent);
    }
    if policy.required_affinity == RequiredAffinityPolicy::Skip
        && node_affinity
            .required_during_scheduling_ignored_during_execution
            .is_some()
    {
        return Decision::Noop(NoopReason::RequiredAffinityPresent);
    }

    Decision::Inject(AffinityInjection::PreferredTerms(vec![term]))
}
