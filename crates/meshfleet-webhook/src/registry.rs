//! Webhook registration
//!
//! Every handler is mounted at its own admission path. The registry is also
//! the source of the `MutatingWebhookConfiguration` and
//! `ValidatingWebhookConfiguration` objects pointing the API server at
//! those paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::info;

use meshfleet_common::{Result, API_GROUP, FIELD_MANAGER};

use crate::adapter::AdmissionHandler;

/// Admission operations a webhook subscribes to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionOperation {
    /// Object creation
    Create,
    /// Object update
    Update,
    /// Object deletion
    Delete,
}

impl AdmissionOperation {
    /// Name used in webhook rules
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Whether a webhook rewrites or only judges objects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookKind {
    /// Returns JSON patches
    Mutating,
    /// Allows or denies
    Validating,
}

/// Resource scope a rule applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleScope {
    /// Cluster-scoped resources
    Cluster,
    /// Namespaced resources
    Namespaced,
}

impl RuleScope {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "Cluster",
            Self::Namespaced => "Namespaced",
        }
    }
}

/// Resources and operations a webhook intercepts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookRule {
    /// API group, empty for core
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name
    pub resource: String,
    /// Intercepted operations
    pub operations: Vec<AdmissionOperation>,
    /// Resource scope
    pub scope: RuleScope,
}

impl WebhookRule {
    /// Rule for a meshfleet CRD
    pub fn meshfleet(resource: &str, operations: &[AdmissionOperation], scope: RuleScope) -> Self {
        Self::new(API_GROUP, meshfleet_common::API_VERSION, resource, operations, scope)
    }

    /// Rule for any group/version/resource
    pub fn new(
        group: &str,
        version: &str,
        resource: &str,
        operations: &[AdmissionOperation],
        scope: RuleScope,
    ) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            operations: operations.to_vec(),
            scope,
        }
    }

    fn to_rule(&self) -> RuleWithOperations {
        RuleWithOperations {
            api_groups: Some(vec![self.group.clone()]),
            api_versions: Some(vec![self.version.clone()]),
            resources: Some(vec![self.resource.clone()]),
            operations: Some(
                self.operations
                    .iter()
                    .map(|o| o.as_str().to_string())
                    .collect(),
            ),
            scope: Some(self.scope.as_str().to_string()),
        }
    }
}

/// Where the API server reaches the webhook server
#[derive(Clone, Debug)]
pub struct WebhookEndpoint {
    /// Service fronting the webhook server
    pub service_name: String,
    /// Namespace of that Service
    pub namespace: String,
    /// Service port
    pub port: i32,
    /// PEM bundle the API server trusts for the serving certificate
    pub ca_bundle: String,
}

/// Path to handler map
#[derive(Default)]
pub struct WebhookRegistry {
    handlers: BTreeMap<String, Arc<dyn AdmissionHandler>>,
}

impl WebhookRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `handler` at `path`, replacing any previous one
    pub fn register(&mut self, path: impl Into<String>, handler: Arc<dyn AdmissionHandler>) {
        self.handlers.insert(path.into(), handler);
    }

    /// Handler mounted at `path`
    pub fn get(&self, path: &str) -> Option<Arc<dyn AdmissionHandler>> {
        self.handlers.get(path).cloned()
    }

    /// All mounted paths
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    fn client_config(endpoint: &WebhookEndpoint, path: &str) -> WebhookClientConfig {
        WebhookClientConfig {
            service: Some(ServiceReference {
                name: endpoint.service_name.clone(),
                namespace: endpoint.namespace.clone(),
                path: Some(path.to_string()),
                port: Some(endpoint.port),
            }),
            ca_bundle: Some(ByteString(endpoint.ca_bundle.clone().into_bytes())),
            url: None,
        }
    }

    fn webhook_name(path: &str) -> String {
        format!("{}.{}", path.trim_start_matches('/').replace('/', "-"), API_GROUP)
    }

    /// Configuration covering every mutating handler
    pub fn mutating_configuration(
        &self,
        name: &str,
        endpoint: &WebhookEndpoint,
    ) -> MutatingWebhookConfiguration {
        let webhooks = self
            .handlers
            .iter()
            .filter(|(_, h)| h.kind() == WebhookKind::Mutating)
            .map(|(path, h)| MutatingWebhook {
                name: Self::webhook_name(path),
                client_config: Self::client_config(endpoint, path),
                rules: Some(vec![h.rule().to_rule()]),
                failure_policy: Some(h.failure_policy().to_string()),
                side_effects: "None".to_string(),
                admission_review_versions: vec!["v1".to_string()],
                ..Default::default()
            })
            .collect();

        MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            webhooks: Some(webhooks),
        }
    }

    /// Configuration covering every validating handler
    pub fn validating_configuration(
        &self,
        name: &str,
        endpoint: &WebhookEndpoint,
    ) -> ValidatingWebhookConfiguration {
        let webhooks = self
            .handlers
            .iter()
            .filter(|(_, h)| h.kind() == WebhookKind::Validating)
            .map(|(path, h)| ValidatingWebhook {
                name: Self::webhook_name(path),
                client_config: Self::client_config(endpoint, path),
                rules: Some(vec![h.rule().to_rule()]),
                failure_policy: Some(h.failure_policy().to_string()),
                side_effects: "None".to_string(),
                admission_review_versions: vec!["v1".to_string()],
                ..Default::default()
            })
            .collect();

        ValidatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            webhooks: Some(webhooks),
        }
    }

    /// Server-side apply both configurations
    pub async fn install(&self, client: Client, name: &str, endpoint: &WebhookEndpoint) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let mutating: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
        mutating
            .patch(name, &params, &Patch::Apply(&self.mutating_configuration(name, endpoint)))
            .await?;

        let validating: Api<ValidatingWebhookConfiguration> = Api::all(client);
        validating
            .patch(name, &params, &Patch::Apply(&self.validating_configuration(name, endpoint)))
            .await?;

        info!(name, handlers = self.handlers.len(), "webhook configurations installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdmissionHandler;

    fn handler(kind: WebhookKind, resource: &str) -> Arc<dyn AdmissionHandler> {
        let mut h = MockAdmissionHandler::new();
        let rule = WebhookRule::meshfleet(
            resource,
            &[AdmissionOperation::Create, AdmissionOperation::Update],
            RuleScope::Cluster,
        );
        h.expect_kind().return_const(kind);
        h.expect_rule().return_const(rule);
        h.expect_failure_policy().return_const("Fail");
        Arc::new(h)
    }

    fn endpoint() -> WebhookEndpoint {
        WebhookEndpoint {
            service_name: "meshfleet-webhook".to_string(),
            namespace: "meshfleet-system".to_string(),
            port: 443,
            ca_bundle: "CA".to_string(),
        }
    }

    #[test]
    fn configurations_split_by_kind() {
        let mut registry = WebhookRegistry::new();
        registry.register("/mutate-cluster", handler(WebhookKind::Mutating, "clusters"));
        registry.register("/validate-cluster", handler(WebhookKind::Validating, "clusters"));
        registry.register("/validate-gtp", handler(WebhookKind::Validating, "globaltrafficpolicies"));

        let mutating = registry.mutating_configuration("meshfleet", &endpoint());
        let validating = registry.validating_configuration("meshfleet", &endpoint());

        assert_eq!(mutating.webhooks.as_ref().unwrap().len(), 1);
        assert_eq!(validating.webhooks.as_ref().unwrap().len(), 2);

        let hook = &mutating.webhooks.unwrap()[0];
        assert_eq!(hook.name, "mutate-cluster.meshfleet.io");
        let service = hook.client_config.service.as_ref().unwrap();
        assert_eq!(service.path.as_deref(), Some("/mutate-cluster"));
        assert_eq!(hook.client_config.ca_bundle, Some(ByteString(b"CA".to_vec())));

        let rule = &hook.rules.as_ref().unwrap()[0];
        assert_eq!(rule.api_groups, Some(vec!["meshfleet.io".to_string()]));
        assert_eq!(
            rule.operations,
            Some(vec!["CREATE".to_string(), "UPDATE".to_string()])
        );
    }

    #[test]
    fn lookup_by_path() {
        let mut registry = WebhookRegistry::new();
        registry.register("/mutate-cluster", handler(WebhookKind::Mutating, "clusters"));
        assert!(registry.get("/mutate-cluster").is_some());
        assert!(registry.get("/mutate-pod").is_none());
        assert_eq!(registry.paths().collect::<Vec<_>>(), vec!["/mutate-cluster"]);
    }
}
