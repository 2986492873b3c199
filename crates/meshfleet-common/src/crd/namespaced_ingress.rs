//! NamespacedIngress CRD: a dedicated ingress controller for one namespace

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PodSecurityContext, SecurityContext};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// NamespacedIngress deploys an ingress proxy serving only its namespace.
///
/// At most one may exist per namespace.
///
/// Example:
/// ```yaml
/// apiVersion: meshfleet.io/v1alpha1
/// kind: NamespacedIngress
/// metadata:
///   namespace: shop
///   name: shop-ingress
/// spec:
///   serviceType: LoadBalancer
///   http:
///     enabled: true
///     port: 80
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "meshfleet.io",
    derive = "PartialEq",
    version = "v1alpha1",
    kind = "NamespacedIngress",
    namespaced,
    status = "NamespacedIngressStatus",
    shortname = "nsig",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedIngressSpec {
    /// Type of the ingress Service
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Plain HTTP listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpListener>,

    /// TLS listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsListener>,

    /// Controller replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Proxy log level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<i32>,

    /// ServiceAccount the controller runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Node selector for controller pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Pod-level security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,

    /// Container-level security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

fn default_service_type() -> String {
    "LoadBalancer".to_string()
}

/// HTTP listener settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpListener {
    /// Whether the listener is served
    #[serde(default)]
    pub enabled: bool,
    /// Service port
    #[serde(default)]
    pub port: i32,
    /// Node port, 0 lets the cluster pick
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// TLS listener settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsListener {
    /// Whether the listener is served
    #[serde(default)]
    pub enabled: bool,
    /// Service port
    #[serde(default)]
    pub port: i32,
    /// Node port, 0 lets the cluster pick
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
    /// Require client certificates
    #[serde(default, rename = "mTLS")]
    pub mtls: bool,
    /// Forward TLS without terminating it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_passthrough: Option<SslPassthrough>,
}

/// SSL passthrough settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SslPassthrough {
    /// Whether passthrough is on
    #[serde(default)]
    pub enabled: bool,
    /// Upstream port passthrough traffic is sent to
    #[serde(default)]
    pub upstream_port: i32,
}

/// NamespacedIngress status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedIngressStatus {
    /// Ready controller replicas
    #[serde(default)]
    pub replicas: i32,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NamespacedIngress {
    /// Name shared by the controller Deployment, Service and ServiceAccount
    pub fn workload_name(&self) -> String {
        format!(
            "{}-{}",
            crate::INGRESS_CONTROLLER_NAME,
            self.namespace().unwrap_or_default()
        )
    }
}
