//! Cluster objects the webhook relies on, rendered as YAML.
//!
//! Deployment packaging lives outside this crate; these renderings are the
//! reference for the `PriorityClass` the controller Pod declares and for the
//! `MutatingWebhookConfiguration` that routes Pod creation to it.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;

use crate::Result;
use crate::config::{Config, FailurePolicy};

/// Name of the single webhook inside the configuration.
pub const WEBHOOK_NAME: &str = "pods.kim-snatch.kyma-project.io";

/// Scheduling priority of the controller Pod.
pub const PRIORITY_VALUE: i32 = 2_000_000;

/// Where the webhook Service lives.
#[derive(Debug, Clone)]
pub struct ManifestParams {
    /// Namespace of the Service
    pub namespace: String,
    /// Name of the Service
    pub service: String,
    /// PEM CA bundle; without it cert-manager is asked to inject one
    pub ca_bundle: Option<Vec<u8>>,
}

/// The controller's `PriorityClass`.
#[must_use]
pub fn priority_class(name: &str) -> PriorityClass {
    PriorityClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        value: PRIORITY_VALUE,
        global_default: Some(false),
        preemption_policy: Some("PreemptLowerPriority".to_string()),
        description: Some("Scheduling priority of the kim-snatch admission webhook".to_string()),
    }
}

/// The `MutatingWebhookConfiguration` for Pod creation in opted-in namespaces.
#[must_use]
pub fn webhook_configuration(
    config: &Config,
    params: &ManifestParams,
) -> MutatingWebhookConfiguration {
    let annotations = params.ca_bundle.is_none().then(|| {
        BTreeMap::from([(
            "cert-manager.io/inject-ca-from".to_string(),
            format!("{}/kim-snatch-serving-cert", params.namespace),
        )])
    });

    let failure_policy = match config.policy.failure_policy {
        FailurePolicy::Ignore => "Ignore",
        FailurePolicy::Fail => "Fail",
    };
    // API server timeout stays above the in-process deadline
    let timeout_seconds =
        i32::try_from(config.server.admission_deadline.as_secs().saturating_add(1))
            .unwrap_or(30)
            .clamp(1, 30);

    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(config.ca_injection.webhook_configuration.clone()),
            annotations,
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: WEBHOOK_NAME.to_string(),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some(failure_policy.to_string()),
            match_policy: Some("Equivalent".to_string()),
            reinvocation_policy: Some("Never".to_string()),
            timeout_seconds: Some(timeout_seconds),
            namespace_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    config.policy.namespace_label_key.clone(),
                    config.policy.namespace_label_value.clone(),
                )])),
                ..Default::default()
            }),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: params.service.clone(),
                    namespace: params.namespace.clone(),
                    path: Some(config.server.webhook_path.clone()),
                    port: Some(443),
                }),
                ca_bundle: params.ca_bundle.clone().map(ByteString),
                ..Default::default()
            },
            ..Default::default()
        }]),
    }
}

/// Both objects as a multi-document YAML stream.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render(config: &Config, params: &ManifestParams) -> Result<String> {
    let priority = serde_yaml::to_string(&priority_class(&config.priority_class_name))?;
    let webhook = serde_yaml::to_string(&webhook_configuration(config, params))?;
    Ok(format!("---\n{priority}---\n{webhook}"))
}
