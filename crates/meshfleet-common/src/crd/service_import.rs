//! ServiceImport CRD: fleet-wide projection of an exported service
//!
//! Endpoints are a flat list keyed by exporting cluster; a cluster's entry
//! is replaced or removed as a unit so other clusters' endpoints survive.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ServiceImport lists, per port, where each accepting cluster serves it.
///
/// Example:
/// ```yaml
/// apiVersion: meshfleet.io/v1alpha1
/// kind: ServiceImport
/// metadata:
///   namespace: shop
///   name: cart
/// spec:
///   type: ClusterIP
///   ports:
///     - port: 80
///       protocol: TCP
///       endpoints:
///         - clusterKey: us/east-1/prod/east
///           targets: ["http://10.0.1.20:8091/cart"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "meshfleet.io",
    version = "v1alpha1",
    kind = "ServiceImport",
    namespaced,
    shortname = "simp",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportSpec {
    /// Service type of the exported service
    #[serde(rename = "type", default)]
    pub type_: String,

    /// Imported ports
    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Sticky sessions requested by the exporter
    #[serde(default)]
    pub session_sticky: bool,

    /// Balancer requested by the exporter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<super::LoadBalancerType>,
}

/// One imported port
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    /// Port name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Port number
    pub port: i32,

    /// Protocol (TCP, UDP, SCTP)
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Application protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,

    /// Per-cluster endpoints
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// Where one cluster serves a port
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Exporting cluster, `region/zone/group/name`
    pub cluster_key: String,

    /// `gateway+path` URLs
    #[serde(default)]
    pub targets: Vec<String>,
}

impl ServiceImportSpec {
    /// Replace `incoming`'s cluster endpoints port by port.
    ///
    /// Ports are matched by number and protocol. Endpoints of other clusters
    /// are kept; ports only `incoming` has are appended. The import's type
    /// and balancing settings follow the latest accepted export.
    pub fn merge_cluster(&mut self, cluster_key: &str, incoming: &ServiceImportSpec) {
        self.type_ = incoming.type_.clone();
        self.session_sticky = incoming.session_sticky;
        self.load_balancer = incoming.load_balancer;

        for port in &mut self.ports {
            port.endpoints.retain(|e| e.cluster_key != cluster_key);
        }

        for new_port in &incoming.ports {
            let entries: Vec<Endpoint> = new_port
                .endpoints
                .iter()
                .filter(|e| e.cluster_key == cluster_key)
                .cloned()
                .collect();
            match self
                .ports
                .iter_mut()
                .find(|p| p.port == new_port.port && p.protocol == new_port.protocol)
            {
                Some(existing) => {
                    existing.endpoints.extend(entries);
                    if existing.name.is_none() {
                        existing.name = new_port.name.clone();
                    }
                }
                None => {
                    let mut port = new_port.clone();
                    port.endpoints = entries;
                    self.ports.push(port);
                }
            }
        }

        self.ports.retain(|p| !p.endpoints.is_empty());
    }

    /// Drop every endpoint of `cluster_key` and ports left empty.
    ///
    /// Returns true when the import no longer has any port.
    pub fn remove_cluster(&mut self, cluster_key: &str) -> bool {
        for port in &mut self.ports {
            port.endpoints.retain(|e| e.cluster_key != cluster_key);
        }
        self.ports.retain(|p| !p.endpoints.is_empty());
        self.ports.is_empty()
    }

    /// Cluster keys with at least one endpoint
    pub fn cluster_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .ports
            .iter()
            .flat_map(|p| p.endpoints.iter().map(|e| e.cluster_key.as_str()))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(cluster: &str, port: i32, target: &str) -> ServiceImportSpec {
        ServiceImportSpec {
            type_: "ClusterIP".to_string(),
            ports: vec![ServicePort {
                name: Some("http".to_string()),
                port,
                protocol: "TCP".to_string(),
                app_protocol: None,
                endpoints: vec![Endpoint {
                    cluster_key: cluster.to_string(),
                    targets: vec![target.to_string()],
                }],
            }],
            ..Default::default()
        }
    }

    // ==========================================================================
    // Story Tests: Endpoints Accumulate Per Accepting Cluster
    // ==========================================================================

    /// Story: two clusters export shop/cart and a third removes its export
    #[test]
    fn story_endpoints_are_kept_per_cluster() {
        let mut import = ServiceImportSpec::default();

        import.merge_cluster("r/z/g/a", &spec_for("r/z/g/a", 80, "http://gw-a/cart"));
        import.merge_cluster("r/z/g/b", &spec_for("r/z/g/b", 80, "http://gw-b/cart"));
        assert_eq!(import.ports.len(), 1);
        assert_eq!(import.cluster_keys(), vec!["r/z/g/a", "r/z/g/b"]);

        // Re-accepting A with a new gateway replaces only A's entry
        import.merge_cluster("r/z/g/a", &spec_for("r/z/g/a", 80, "http://gw-a2/cart"));
        let a: Vec<_> = import.ports[0]
            .endpoints
            .iter()
            .filter(|e| e.cluster_key == "r/z/g/a")
            .collect();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].targets, vec!["http://gw-a2/cart".to_string()]);

        // Removing B keeps A
        assert!(!import.remove_cluster("r/z/g/b"));
        assert_eq!(import.cluster_keys(), vec!["r/z/g/a"]);

        // Removing the last cluster empties the import
        assert!(import.remove_cluster("r/z/g/a"));
    }

    #[test]
    fn ports_only_one_cluster_serves_are_dropped_with_it() {
        let mut import = spec_for("r/z/g/a", 80, "http://gw-a/cart");
        import.merge_cluster("r/z/g/b", &spec_for("r/z/g/b", 8080, "http://gw-b/admin"));
        assert_eq!(import.ports.len(), 2);

        assert!(!import.remove_cluster("r/z/g/b"));
        assert_eq!(import.ports.len(), 1);
        assert_eq!(import.ports[0].port, 80);
    }

    #[test]
    fn merge_ignores_endpoints_of_other_clusters_in_incoming() {
        let mut import = ServiceImportSpec::default();
        let mut incoming = spec_for("r/z/g/a", 80, "http://gw-a/cart");
        incoming.ports[0].endpoints.push(Endpoint {
            cluster_key: "r/z/g/x".to_string(),
            targets: vec!["http://spoofed".to_string()],
        });
        import.merge_cluster("r/z/g/a", &incoming);
        assert_eq!(import.cluster_keys(), vec!["r/z/g/a"]);
    }
}
