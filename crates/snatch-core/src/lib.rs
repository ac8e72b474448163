//! kim-snatch core primitives
//!
//! Pure, I/O-free building blocks of the Pod mutation policy:
//!
//! - [`Scope`]: whether a namespace opted in
//! - [`AffinityPolicy`]: which node pool Pods are steered to
//! - [`PatchOperation`]: the closed set of RFC 6902 operations we emit
//! - [`decide`]: the mutation decision itself
//!
//! Nothing in this crate touches the network, the clock or shared state, so
//! every decision is reproducible from its inputs alone.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod patch;
mod scope;

pub use engine::{
    AffinityInjection, AffinityPolicy, Decision, NoopReason, RequiredAffinityPolicy, decide,
};
pub use patch::{PatchOperation, PatchPath};
pub use scope::Scope;

/// Label key Gardener puts on every node of a worker pool.
pub const WORKER_POOL_LABEL: &str = "worker.gardener.cloud/pool";

/// Namespace label marking namespaces whose Pods are steered to the pool.
pub const MANAGED_BY_LABEL: &str = "operator.kyma-project.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] that opts a namespace in.
pub const MANAGED_BY_VALUE: &str = "kyma";
