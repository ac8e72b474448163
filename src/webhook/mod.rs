//! Admission webhook: request handling, HTTP routing and the TLS server.

mod admission;
mod router;
mod server;

pub use admission::{AdmissionHandler, BadReview, Outcome};
pub use router::{MetricsState, metrics_router, webhook_router};
pub use server::{WebhookServer, shutdown_signal};

use snatch_core::PatchOperation;

use crate::Result;

/// Convert patch operations into the `json_patch` document kube expects.
///
/// # Errors
///
/// Returns an error if an operation does not serialize to a valid RFC 6902
/// operation.
pub fn to_json_patch(ops: &[PatchOperation]) -> Result<json_patch::Patch> {
    let value = serde_json::to_value(ops)?;
    Ok(serde_json::from_value(value)?)
}
