//! Process configuration for the manager and connector binaries
//!
//! Both read an optional YAML file and then apply environment overrides.
//! The environment is read through [`EnvSource`] so tests never touch the
//! process environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use meshfleet_common::{Error, Result, MESH_NAMESPACE};

/// Namespace of the mesh components
pub const ENV_NAMESPACE: &str = "MESHFLEET_NAMESPACE";
/// Webhook server port
pub const ENV_WEBHOOK_PORT: &str = "MESHFLEET_WEBHOOK_PORT";
/// Health server port
pub const ENV_HEALTH_PORT: &str = "MESHFLEET_HEALTH_PORT";
/// Directory peer kubeconfigs are written to
pub const ENV_KUBECONFIG_DIR: &str = "MESHFLEET_KUBECONFIG_DIR";
/// Cluster record a standalone connector serves
pub const ENV_CLUSTER_NAME: &str = "MESHFLEET_CLUSTER_NAME";

/// Read access to environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// [`EnvSource`] over the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Admission webhook settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookSettings {
    /// HTTPS port the server listens on
    pub port: u16,
    /// Service the API server calls
    pub service_name: String,
    /// Service port
    pub service_port: i32,
    /// Name of the webhook configurations
    pub configuration_name: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            port: meshfleet_webhook::server::DEFAULT_WEBHOOK_PORT,
            service_name: "meshfleet-webhook".to_string(),
            service_port: 443,
            configuration_name: "meshfleet-webhooks".to_string(),
        }
    }
}

/// `meshfleet-manager` configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    /// Namespace of the mesh components
    pub namespace: String,
    /// Health server port
    pub health_port: u16,
    /// Admission webhooks
    pub webhook: WebhookSettings,
    /// Directory peer kubeconfigs are written to
    pub kubeconfig_dir: PathBuf,
    /// How long startup waits for the mesh config ConfigMap
    pub mesh_config_timeout_secs: u64,
    /// Install CRDs on startup
    pub install_crds: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            namespace: MESH_NAMESPACE.to_string(),
            health_port: 8081,
            webhook: WebhookSettings::default(),
            kubeconfig_dir: PathBuf::from("/var/run/meshfleet/kubeconfigs"),
            mesh_config_timeout_secs: 120,
            install_crds: true,
        }
    }
}

impl ManagerConfig {
    /// Load `path` (defaults when absent) and apply environment overrides
    pub fn load(path: Option<&Path>, env: &dyn EnvSource) -> Result<Self> {
        let mut config: Self = read_yaml(path)?;
        if let Some(namespace) = env.var(ENV_NAMESPACE) {
            config.namespace = namespace;
        }
        if let Some(port) = env.var(ENV_HEALTH_PORT) {
            config.health_port = parse_port(ENV_HEALTH_PORT, &port)?;
        }
        if let Some(port) = env.var(ENV_WEBHOOK_PORT) {
            config.webhook.port = parse_port(ENV_WEBHOOK_PORT, &port)?;
        }
        if let Some(dir) = env.var(ENV_KUBECONFIG_DIR) {
            config.kubeconfig_dir = PathBuf::from(dir);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::validation_for_field(
                "ManagerConfig",
                "namespace",
                "namespace must not be empty",
            ));
        }
        if self.health_port == self.webhook.port {
            return Err(Error::validation_for(
                "ManagerConfig",
                format!("health and webhook servers both use port {}", self.health_port),
            ));
        }
        Ok(())
    }

    /// Listen address of the health server
    pub fn health_addr(&self) -> SocketAddr {
        any_addr(self.health_port)
    }

    /// Listen address of the webhook server
    pub fn webhook_addr(&self) -> SocketAddr {
        any_addr(self.webhook.port)
    }
}

/// `meshfleet-connector` configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorConfig {
    /// Namespace of the mesh components
    pub namespace: String,
    /// Cluster record this connector serves
    pub cluster_name: String,
    /// Health server port
    pub health_port: u16,
    /// Directory the peer kubeconfig is written to
    pub kubeconfig_dir: PathBuf,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            namespace: MESH_NAMESPACE.to_string(),
            cluster_name: String::new(),
            health_port: 8082,
            kubeconfig_dir: PathBuf::from("/var/run/meshfleet/kubeconfigs"),
        }
    }
}

impl ConnectorConfig {
    /// Load `path` (defaults when absent) and apply environment overrides
    pub fn load(path: Option<&Path>, env: &dyn EnvSource) -> Result<Self> {
        let mut config: Self = read_yaml(path)?;
        if let Some(namespace) = env.var(ENV_NAMESPACE) {
            config.namespace = namespace;
        }
        if let Some(name) = env.var(ENV_CLUSTER_NAME) {
            config.cluster_name = name;
        }
        if let Some(port) = env.var(ENV_HEALTH_PORT) {
            config.health_port = parse_port(ENV_HEALTH_PORT, &port)?;
        }
        if let Some(dir) = env.var(ENV_KUBECONFIG_DIR) {
            config.kubeconfig_dir = PathBuf::from(dir);
        }
        if config.cluster_name.is_empty() {
            return Err(Error::validation_for_field(
                "ConnectorConfig",
                "clusterName",
                format!("cluster name is required, set clusterName or {ENV_CLUSTER_NAME}"),
            ));
        }
        Ok(config)
    }

    /// Listen address of the health server
    pub fn health_addr(&self) -> SocketAddr {
        any_addr(self.health_port)
    }
}

fn read_yaml<T: for<'de> Deserialize<'de> + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::fatal(format!("failed to read config {}: {e}", path.display()))
    })?;
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(&raw).map_err(|e| {
        Error::serialization_for_kind("config", format!("{}: {e}", path.display()))
    })
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| Error::validation_for_field("environment", key, format!("invalid port {value:?}")))
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}
