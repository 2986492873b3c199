//! ServiceExport CRD: a local service offered to the fleet

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{condition_is, condition_types, Condition, ConditionStatus};

/// ServiceExport declares that the same-named Service may be consumed by peers.
///
/// Example:
/// ```yaml
/// apiVersion: meshfleet.io/v1alpha1
/// kind: ServiceExport
/// metadata:
///   namespace: shop
///   name: cart
/// spec:
///   rules:
///     - portNumber: 80
///       path: /cart
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "meshfleet.io",
    derive = "PartialEq",
    version = "v1alpha1",
    kind = "ServiceExport",
    namespaced,
    status = "ServiceExportStatus",
    shortname = "sexp",
    printcolumn = r#"{"name":"Valid","type":"string","jsonPath":".status.conditions[?(@.type=='Valid')].status"}"#,
    printcolumn = r#"{"name":"Conflict","type":"string","jsonPath":".status.conditions[?(@.type=='Conflict')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportSpec {
    /// Exported ports and the gateway path each is reachable under
    #[serde(default)]
    pub rules: Vec<ServiceExportRule>,

    /// Rewrite applied by peers before forwarding, `from` and `to`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_rewrite: Option<PathRewrite>,

    /// Sticky sessions on the importing side
    #[serde(default)]
    pub session_sticky: bool,

    /// Balancing algorithm on the importing side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerType>,
}

/// One exported port
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportRule {
    /// Service port number
    pub port_number: i32,

    /// Gateway path prefix peers use to reach the port
    #[serde(default)]
    pub path: String,
}

/// Path rewrite pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PathRewrite {
    /// Matched prefix
    pub from: String,
    /// Replacement
    pub to: String,
}

/// Balancing algorithm
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LoadBalancerType {
    /// Round robin
    #[default]
    RoundRobinLoadBalancer,
    /// Consistent hashing
    HashingLoadBalancer,
    /// Least outstanding work
    LeastWorkLoadBalancer,
}

/// ServiceExport status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportStatus {
    /// `Valid` and `Conflict` conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ServiceExport {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// True when the export is marked invalid or conflicting.
    ///
    /// Such exports are skipped by federation until the user fixes them.
    pub fn is_blocked(&self) -> bool {
        condition_is(
            self.conditions(),
            condition_types::VALID,
            ConditionStatus::False,
        ) || condition_is(
            self.conditions(),
            condition_types::CONFLICT,
            ConditionStatus::True,
        )
    }

    /// Rule exporting the given port, if any
    pub fn rule_for_port(&self, port: i32) -> Option<&ServiceExportRule> {
        self.spec.rules.iter().find(|r| r.port_number == port)
    }
}
