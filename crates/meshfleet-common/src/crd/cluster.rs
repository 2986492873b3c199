//! Cluster CRD: one member of the fleet
//!
//! Exactly one `InCluster` Cluster exists per control plane and it is named
//! [`LOCAL_CLUSTER_NAME`](crate::LOCAL_CLUSTER_NAME). Every other member is an
//! `OutCluster` reached through its kubeconfig and exposed to peers through
//! its gateway address.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::{kube_utils, Error, Result};

/// Cluster registers a fleet member with the control plane.
///
/// Example:
/// ```yaml
/// apiVersion: meshfleet.io/v1alpha1
/// kind: Cluster
/// metadata:
///   name: east
/// spec:
///   mode: OutCluster
///   region: us
///   zone: east-1
///   group: prod
///   gateway: 10.0.1.20:8091
///   controlPlaneRepoRootUrl: http://repo.meshfleet-system:6060
///   kubeconfig: |
///     apiVersion: v1
///     kind: Config
///     ...
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "meshfleet.io",
    derive = "PartialEq",
    version = "v1alpha1",
    kind = "Cluster",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Zone","type":"string","jsonPath":".spec.zone"}"#,
    printcolumn = r#"{"name":"Group","type":"string","jsonPath":".spec.group"}"#,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".spec.gateway"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Whether this is the home cluster or a remote peer
    #[serde(default)]
    pub mode: ClusterMode,

    /// Region of the cluster
    #[serde(default = "default_geo")]
    pub region: String,

    /// Zone of the cluster
    #[serde(default = "default_geo")]
    pub zone: String,

    /// Logical group of the cluster
    #[serde(default = "default_geo")]
    pub group: String,

    /// Externally reachable ingress address, `host:port` (OutCluster)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Kubeconfig document used to reach the cluster (OutCluster).
    ///
    /// Materialized into the `cluster-credentials-<name>` Secret; the
    /// connector loads it from there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,

    /// Root URL of the control plane's codebase repo, as seen from the peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_repo_root_url: Option<String>,

    /// Repo path prefix on the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_repo_path: Option<String>,

    /// Repo API path prefix on the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_repo_api_path: Option<String>,

    /// Connector replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

fn default_geo() -> String {
    "default".to_string()
}

fn default_replicas() -> i32 {
    1
}

/// Connection mode of a Cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterMode {
    /// The cluster the control plane runs in
    #[default]
    InCluster,
    /// A peer reached via kubeconfig
    OutCluster,
}

impl std::fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InCluster => write!(f, "InCluster"),
            Self::OutCluster => write!(f, "OutCluster"),
        }
    }
}

/// Cluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// `namespace/name` of the credentials Secret derived from the kubeconfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Connector conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ClusterSpec {
    /// Hash over the whole spec; a change restarts the connector
    pub fn spec_hash(&self) -> Result<String> {
        kube_utils::hash_value(self)
    }

    /// Fleet identity for a cluster of the given name
    pub fn key(&self, name: &str) -> ClusterKey {
        ClusterKey {
            region: self.region.clone(),
            zone: self.zone.clone(),
            group: self.group.clone(),
            name: name.to_string(),
        }
    }
}

impl Cluster {
    /// Fleet identity of this cluster
    pub fn key(&self) -> ClusterKey {
        self.spec.key(&self.name_any())
    }

    /// True for the home cluster
    pub fn is_in_cluster(&self) -> bool {
        self.spec.mode == ClusterMode::InCluster
    }

    /// Name of the Secret holding this cluster's kubeconfig
    pub fn credentials_secret_name(&self) -> String {
        format!("cluster-credentials-{}", self.name_any())
    }
}

/// Fleet identity `region/zone/group/name`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    /// Region
    pub region: String,
    /// Zone
    pub zone: String,
    /// Group
    pub group: String,
    /// Cluster name
    pub name: String,
}

impl ClusterKey {
    /// Build a key from its parts
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            group: group.into(),
            name: name.into(),
        }
    }

    /// Codebase of `pipeline` (services, ingress, gateways) owned by this
    /// cluster: `/<region>/<zone>/<group>/<name>/<pipeline>`
    pub fn codebase_path(&self, pipeline: &str) -> String {
        format!("/{self}/{pipeline}")
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}/{}", self.region, self.zone, self.group, self.name)
    }
}

impl std::str::FromStr for ClusterKey {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [region, zone, group, name] if parts.iter().all(|p| !p.is_empty()) => {
                Ok(Self::new(*region, *zone, *group, *name))
            }
            _ => Err(Error::validation(format!(
                "invalid cluster key {s:?}, expected region/zone/group/name"
            ))),
        }
    }
}
