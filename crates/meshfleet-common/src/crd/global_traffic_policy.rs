//! GlobalTrafficPolicy CRD: how an imported service balances across clusters

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// GlobalTrafficPolicy selects the cross-cluster balancing mode of the
/// same-named ServiceImport.
///
/// Example:
/// ```yaml
/// apiVersion: meshfleet.io/v1alpha1
/// kind: GlobalTrafficPolicy
/// metadata:
///   namespace: shop
///   name: cart
/// spec:
///   lbType: ActiveActive
///   targets:
///     - clusterKey: us/east-1/prod/east
///       weight: 80
///     - clusterKey: us/west-1/prod/west
///       weight: 20
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "meshfleet.io",
    version = "v1alpha1",
    kind = "GlobalTrafficPolicy",
    namespaced,
    shortname = "gtp",
    printcolumn = r#"{"name":"LB Type","type":"string","jsonPath":".spec.lbType"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTrafficPolicySpec {
    /// Balancing mode
    #[serde(default)]
    pub lb_type: LoadBalancerMode,

    /// Participating clusters
    #[serde(default)]
    pub targets: Vec<TrafficTarget>,
}

/// Cross-cluster balancing mode
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LoadBalancerMode {
    /// Stay in the local cluster, or the one named target
    #[default]
    Locality,
    /// Local first, then the listed clusters
    FailOver,
    /// Weighted across the listed clusters
    ActiveActive,
}

/// One participating cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTarget {
    /// Cluster key, `region/zone/group/name`
    pub cluster_key: String,

    /// Relative weight (`ActiveActive`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}
