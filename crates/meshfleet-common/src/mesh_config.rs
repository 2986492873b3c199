//! The mesh config document
//!
//! A singleton JSON document stored under [`MESH_CONFIG_KEY`](crate::MESH_CONFIG_KEY)
//! in the [`MESH_CONFIG_NAME`](crate::MESH_CONFIG_NAME) ConfigMap. Every
//! component reads it through the config store; remote connectors write the
//! role flags of peer clusters.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::ClusterKey;
use crate::{Error, Result};

/// Default repo path prefix
pub const DEFAULT_REPO_PATH: &str = "/repo";
/// Default repo API path prefix
pub const DEFAULT_REPO_API_PATH: &str = "/api/v1/repo";

/// Typed mesh config document
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    /// This cluster evaluates federation decisions
    #[serde(default = "default_true")]
    pub is_control_plane: bool,

    /// This cluster has joined a fleet run by another control plane
    #[serde(default)]
    pub is_managed: bool,

    /// Root URL of the codebase repo server
    #[serde(rename = "repoRootURL", default)]
    pub repo_root_url: String,

    /// Path prefix codebases are served under
    #[serde(default = "default_repo_path")]
    pub repo_path: String,

    /// Path prefix of the repo management API
    #[serde(default = "default_repo_api_path")]
    pub repo_api_path: String,

    /// Interval of the repo rebuild job
    #[serde(default = "default_recover_interval")]
    pub repo_recover_interval_in_seconds: u32,

    /// Images of deployed components
    #[serde(default)]
    pub images: Images,

    /// Mesh ingress controller
    #[serde(default)]
    pub ingress: Ingress,

    /// Proxy access log shipping
    #[serde(default)]
    pub logging: Logging,

    /// Identity of this cluster
    #[serde(default)]
    pub cluster: ClusterIdentity,

    /// Certificate backend
    #[serde(default)]
    pub certificate: Certificate,

    /// Gateway API support
    #[serde(default)]
    pub gateway_api: Toggle,

    /// Built-in service load balancer
    #[serde(rename = "serviceLB", default)]
    pub service_lb: Toggle,

    /// Per-namespace ingress controllers
    #[serde(default)]
    pub namespaced_ingress: Toggle,
}

fn default_true() -> bool {
    true
}

fn default_repo_path() -> String {
    DEFAULT_REPO_PATH.to_string()
}

fn default_repo_api_path() -> String {
    DEFAULT_REPO_API_PATH.to_string()
}

fn default_recover_interval() -> u32 {
    60
}

/// Component images
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Images {
    /// Registry/repository prefix
    #[serde(default)]
    pub repository: String,
    /// Proxy image name and tag
    #[serde(default)]
    pub proxy_image: String,
    /// Proxy init image name and tag
    #[serde(default)]
    pub proxy_init_image: String,
    /// Service load balancer image name and tag
    #[serde(default)]
    pub service_lb_image: String,
}

/// Feature toggle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Toggle {
    /// Whether the feature is on
    #[serde(default)]
    pub enabled: bool,
}

/// Mesh ingress settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    /// Whether the mesh ingress runs
    #[serde(default)]
    pub enabled: bool,
    /// HTTP listener
    #[serde(default)]
    pub http: HttpListener,
    /// TLS listener
    #[serde(default)]
    pub tls: TlsListener,
}

/// HTTP listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpListener {
    /// Whether the listener is served
    #[serde(default)]
    pub enabled: bool,
    /// Service port
    #[serde(default)]
    pub listen: i32,
    /// Container port
    #[serde(default)]
    pub bind: i32,
    /// Node port, 0 lets the cluster pick
    #[serde(default)]
    pub node_port: i32,
}

/// TLS listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsListener {
    /// Whether the listener is served
    #[serde(default)]
    pub enabled: bool,
    /// Service port
    #[serde(default)]
    pub listen: i32,
    /// Container port
    #[serde(default)]
    pub bind: i32,
    /// Node port, 0 lets the cluster pick
    #[serde(default)]
    pub node_port: i32,
    /// Require client certificates
    #[serde(rename = "mTLS", default)]
    pub mtls: bool,
    /// Forward TLS without terminating it
    #[serde(default)]
    pub ssl_passthrough: SslPassthrough,
}

/// SSL passthrough
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SslPassthrough {
    /// Whether passthrough is on
    #[serde(default)]
    pub enabled: bool,
    /// Upstream port
    #[serde(default = "default_upstream_port")]
    pub upstream_port: i32,
}

fn default_upstream_port() -> i32 {
    443
}

/// Log shipping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Logging {
    /// Whether proxies ship logs
    #[serde(default)]
    pub enabled: bool,
    /// Secret with `url` and `token` keys
    #[serde(default)]
    pub secret_name: String,
}

/// Identity of the cluster this document belongs to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIdentity {
    /// Region
    #[serde(default)]
    pub region: String,
    /// Zone
    #[serde(default)]
    pub zone: String,
    /// Group
    #[serde(default)]
    pub group: String,
    /// Cluster name
    #[serde(default)]
    pub name: String,
    /// Unique id of this cluster
    #[serde(default)]
    pub uid: String,
    /// Unique id of the control plane managing this cluster
    #[serde(rename = "controlPlaneUID", default)]
    pub control_plane_uid: String,
}

/// Certificate backend selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    /// Backend kind
    #[serde(default)]
    pub manager: CertificateManagerKind,
    /// Secret holding the CA bundle
    #[serde(default = "default_ca_bundle_name")]
    pub ca_bundle_name: String,
    /// Namespace of the CA bundle Secret; defaults to the mesh namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_namespace: Option<String>,
}

fn default_ca_bundle_name() -> String {
    "meshfleet-ca-bundle".to_string()
}

/// Certificate backend kinds
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CertificateManagerKind {
    /// In-process CA, created on first use
    #[default]
    Archon,
    /// CA provided by the operator in the CA bundle Secret
    Manual,
}

impl MeshConfig {
    /// Parse and validate a document
    pub fn parse(json: &str) -> Result<Self> {
        let config: MeshConfig = serde_json::from_str(json)
            .map_err(|e| Error::serialization_for_kind("MeshConfig", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to the stored form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check field ranges and required values
    pub fn validate(&self) -> Result<()> {
        if self.repo_root_url.is_empty() {
            return Err(Error::validation_for_field(
                "MeshConfig",
                "repoRootURL",
                "repoRootURL is required",
            ));
        }
        if !(1..=3600).contains(&self.repo_recover_interval_in_seconds) {
            return Err(Error::validation_for_field(
                "MeshConfig",
                "repoRecoverIntervalInSeconds",
                "must be between 1 and 3600",
            ));
        }
        if self.cluster.name.is_empty() {
            return Err(Error::validation_for_field(
                "MeshConfig",
                "cluster.name",
                "cluster name is required",
            ));
        }

        let http = &self.ingress.http;
        let tls = &self.ingress.tls;
        if self.ingress.enabled && http.enabled {
            check_port("ingress.http.listen", http.listen)?;
            check_port("ingress.http.bind", http.bind)?;
        }
        if self.ingress.enabled && tls.enabled {
            check_port("ingress.tls.listen", tls.listen)?;
            check_port("ingress.tls.bind", tls.bind)?;
            if tls.ssl_passthrough.enabled {
                check_port(
                    "ingress.tls.sslPassthrough.upstreamPort",
                    tls.ssl_passthrough.upstream_port,
                )?;
            }
        }
        check_node_port("ingress.http.nodePort", http.node_port)?;
        check_node_port("ingress.tls.nodePort", tls.node_port)?;
        Ok(())
    }

    /// True when this cluster evaluates federation decisions
    pub fn is_control_plane(&self) -> bool {
        self.is_control_plane
            && (self.cluster.control_plane_uid.is_empty()
                || self.cluster.control_plane_uid == self.cluster.uid)
    }

    /// Fleet identity of this cluster
    pub fn cluster_key(&self) -> ClusterKey {
        ClusterKey::new(
            &self.cluster.region,
            &self.cluster.zone,
            &self.cluster.group,
            &self.cluster.name,
        )
    }

    /// URL codebases are fetched from
    pub fn repo_base_url(&self) -> String {
        format!("{}{}", self.repo_root_url.trim_end_matches('/'), self.repo_path)
    }

    /// URL of the repo management API
    pub fn repo_api_base_url(&self) -> String {
        format!(
            "{}{}",
            self.repo_root_url.trim_end_matches('/'),
            self.repo_api_path
        )
    }

    /// Fully qualified proxy image
    pub fn proxy_image(&self) -> String {
        qualify(&self.images.repository, &self.images.proxy_image)
    }

    /// Fully qualified proxy init image
    pub fn proxy_init_image(&self) -> String {
        qualify(&self.images.repository, &self.images.proxy_init_image)
    }

    /// Fully qualified service load balancer image
    pub fn service_lb_image(&self) -> String {
        qualify(&self.images.repository, &self.images.service_lb_image)
    }

    /// Namespace of the CA bundle Secret
    pub fn ca_bundle_namespace(&self, mesh_namespace: &str) -> String {
        self.certificate
            .ca_bundle_namespace
            .clone()
            .unwrap_or_else(|| mesh_namespace.to_string())
    }

    /// Codebase the services document of this cluster is written to
    pub fn services_codebase_path(&self) -> String {
        "/local/services".to_string()
    }

    /// Codebase the ingress document of this cluster is written to
    pub fn ingress_codebase_path(&self) -> String {
        "/local/ingress".to_string()
    }

    /// Codebase the gateways document of this cluster is written to
    pub fn gateways_codebase_path(&self) -> String {
        "/local/gateways".to_string()
    }

    /// Codebase of the NamespacedIngress of `namespace`
    pub fn namespaced_ingress_codebase_path(&self, namespace: &str) -> String {
        format!("/local/nsig/{namespace}")
    }
}

fn qualify(repository: &str, image: &str) -> String {
    if repository.is_empty() {
        image.to_string()
    } else {
        format!("{}/{}", repository.trim_end_matches('/'), image)
    }
}

fn check_port(field: &str, port: i32) -> Result<()> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(Error::validation_for_field(
            "MeshConfig",
            field,
            format!("port {port} out of range 1-65535"),
        ))
    }
}

fn check_node_port(field: &str, port: i32) -> Result<()> {
    if (0..=65535).contains(&port) {
        Ok(())
    } else {
        Err(Error::validation_for_field(
            "MeshConfig",
            field,
            format!("node port {port} out of range 0-65535"),
        ))
    }
}

/// Sample document used by tests across the workspace
#[doc(hidden)]
pub fn sample_json() -> &'static str {
    r#"{
        "isControlPlane": true,
        "isManaged": false,
        "repoRootURL": "http://repo.meshfleet-system:6060",
        "images": {
            "repository": "meshfleet",
            "proxyImage": "proxy:1.0.0",
            "proxyInitImage": "proxy-init:1.0.0",
            "serviceLbImage": "svclb:1.0.0"
        },
        "ingress": {
            "enabled": true,
            "http": { "enabled": true, "listen": 80, "bind": 8000, "nodePort": 30508 },
            "tls": {
                "enabled": false, "listen": 443, "bind": 8443, "nodePort": 30607,
                "mTLS": false,
                "sslPassthrough": { "enabled": false, "upstreamPort": 443 }
            }
        },
        "logging": { "enabled": false, "secretName": "meshfleet-logging" },
        "cluster": {
            "region": "us", "zone": "east-1", "group": "prod", "name": "local",
            "uid": "uid-home", "controlPlaneUID": ""
        },
        "certificate": { "manager": "archon" },
        "gatewayApi": { "enabled": false },
        "serviceLB": { "enabled": false },
        "namespacedIngress": { "enabled": false }
    }"#
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MeshConfig {
        MeshConfig::parse(sample_json()).unwrap()
    }

    #[test]
    fn parses_sample_with_defaults() {
        let config = sample();
        assert_eq!(config.repo_path, "/repo");
        assert_eq!(config.repo_api_path, "/api/v1/repo");
        assert_eq!(config.repo_recover_interval_in_seconds, 60);
        assert_eq!(config.certificate.ca_bundle_name, "meshfleet-ca-bundle");
        assert_eq!(config.certificate.manager, CertificateManagerKind::Archon);
    }

    #[test]
    fn derived_urls_and_images() {
        let config = sample();
        assert_eq!(
            config.repo_api_base_url(),
            "http://repo.meshfleet-system:6060/api/v1/repo"
        );
        assert_eq!(
            config.repo_base_url(),
            "http://repo.meshfleet-system:6060/repo"
        );
        assert_eq!(config.proxy_image(), "meshfleet/proxy:1.0.0");
        assert_eq!(config.cluster_key().to_string(), "us/east-1/prod/local");
        assert_eq!(config.namespaced_ingress_codebase_path("shop"), "/local/nsig/shop");
    }

    #[test]
    fn control_plane_follows_uids() {
        let mut config = sample();
        assert!(config.is_control_plane());

        config.cluster.control_plane_uid = "uid-home".to_string();
        assert!(config.is_control_plane());

        config.cluster.control_plane_uid = "uid-other".to_string();
        assert!(!config.is_control_plane());

        config.cluster.control_plane_uid = String::new();
        config.is_control_plane = false;
        assert!(!config.is_control_plane());
    }

    #[test]
    fn validation_rejects_bad_ports_and_missing_fields() {
        let mut config = sample();
        config.ingress.http.listen = 70000;
        assert!(matches!(
            config.validate(),
            Err(Error::Validation { field: Some(f), .. }) if f == "ingress.http.listen"
        ));

        let mut config = sample();
        config.repo_root_url.clear();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.repo_recover_interval_in_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.ingress.tls.node_port = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_listeners_are_not_port_checked() {
        let mut config = sample();
        config.ingress.tls.enabled = false;
        config.ingress.tls.listen = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        assert!(matches!(
            MeshConfig::parse("{not json"),
            Err(Error::Serialization { .. })
        ));
    }

    #[test]
    fn serialized_form_uses_document_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("repoRootURL").is_some());
        assert!(json.get("serviceLB").is_some());
        assert!(json["ingress"]["tls"].get("mTLS").is_some());
        assert!(json["cluster"].get("controlPlaneUID").is_some());
    }
}
