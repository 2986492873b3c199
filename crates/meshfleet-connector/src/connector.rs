//! Per-cluster connectors
//!
//! A connector owns everything the fleet does with one member cluster: the
//! ServiceExport watcher, the federation event handler and, for the home
//! cluster, the document sync loop. Remote connectors first bring the peer
//! under management.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::crd::{Cluster, ClusterKey, ServiceExport};
use meshfleet_common::events::EventPublisher;
use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::retry::{retry_with_fibonacci_if, RetryConfig};
use meshfleet_common::{Error, Result, GATEWAYS_BASE_PATH, INGRESS_BASE_PATH, SERVICES_BASE_PATH};
use meshfleet_config::{MeshConfigApi, MeshConfigStore};
use meshfleet_repo::RepoClient;

use crate::bus::{Geo, MessageBus};
use crate::exports::{ExportWatcher, FederationEvents};
use crate::fleet::{self, FleetApi};
use crate::local::{BoundedRunner, LocalSync};
use crate::remote;

/// Attempts per codebase derivation
const DERIVE_ATTEMPTS: u32 = 5;

/// Codebases a cluster's documents are written to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterCodebases {
    /// Service registry codebase
    pub services: String,
    /// Ingress config codebase
    pub ingress: String,
    /// Gateway routes codebase, when Gateway API is enabled
    pub gateways: Option<String>,
}

impl ClusterCodebases {
    /// Codebases of `cluster`.
    ///
    /// The home cluster uses the paths of the mesh config; peers get paths
    /// under their cluster key.
    pub fn for_cluster(cluster: &Cluster, config: &MeshConfig) -> Self {
        let gateways_enabled = config.gateway_api.enabled;
        if cluster.is_in_cluster() {
            Self {
                services: config.services_codebase_path(),
                ingress: config.ingress_codebase_path(),
                gateways: gateways_enabled.then(|| config.gateways_codebase_path()),
            }
        } else {
            let key = cluster.key();
            Self {
                services: key.codebase_path("services"),
                ingress: key.codebase_path("ingress"),
                gateways: gateways_enabled.then(|| key.codebase_path("gateways")),
            }
        }
    }

    /// Derive every codebase from its base; existing ones are left alone
    pub async fn derive(&self, repo: &dyn RepoClient) -> Result<()> {
        let mut pairs = vec![
            (self.services.as_str(), SERVICES_BASE_PATH),
            (self.ingress.as_str(), INGRESS_BASE_PATH),
        ];
        if let Some(gateways) = self.gateways.as_deref() {
            pairs.push((gateways, GATEWAYS_BASE_PATH));
        }

        let retry = RetryConfig::with_max_attempts(DERIVE_ATTEMPTS);
        for (path, base) in pairs {
            retry_with_fibonacci_if(
                &retry,
                &format!("derive {path}"),
                |e: &Error| e.is_retryable(),
                || async { repo.derive_codebase(path, base).await.map_err(Error::from) },
            )
            .await?;
        }
        Ok(())
    }
}

/// A running link to one member cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Fleet identity of the cluster
    fn key(&self) -> ClusterKey;

    /// True for the home cluster
    fn is_local(&self) -> bool;

    /// Run until `cancel` fires; an error means the connector cannot work
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    /// True when the cluster has a ServiceImport for `export`
    async fn service_import_exists(&self, export: &ServiceExport) -> Result<bool>;

    /// Check `export` of `service` against the cluster's own Service of the
    /// same name
    async fn validate_service_export(&self, export: &ServiceExport, service: &Service)
        -> Result<()>;
}

enum Kind {
    Local {
        repo: Arc<dyn RepoClient>,
        codebases: ClusterCodebases,
        mesh_namespace: String,
    },
    Remote {
        peer_config: Arc<dyn MeshConfigApi>,
        control_plane: Arc<MeshConfigStore>,
    },
}

/// [`Connector`] for either kind of cluster
pub struct ClusterConnector {
    kind: Kind,
    geo: Geo,
    client: Client,
    fleet: Arc<dyn FleetApi>,
    bus: MessageBus,
    events: Arc<dyn EventPublisher>,
}

/// Collaborators shared by every connector
#[derive(Clone)]
pub struct ConnectorDeps {
    /// Federation message bus
    pub bus: MessageBus,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Repo client
    pub repo: Arc<dyn RepoClient>,
    /// Control plane mesh config
    pub mesh_config: Arc<MeshConfigStore>,
    /// Namespace of the mesh components
    pub mesh_namespace: String,
}

impl ClusterConnector {
    /// Connector for the home cluster
    pub fn local(cluster: &Cluster, client: Client, fleet: Arc<dyn FleetApi>, deps: &ConnectorDeps, codebases: ClusterCodebases) -> Self {
        Self {
            kind: Kind::Local {
                repo: deps.repo.clone(),
                codebases,
                mesh_namespace: deps.mesh_namespace.clone(),
            },
            geo: geo_of(cluster),
            client,
            fleet,
            bus: deps.bus.clone(),
            events: deps.events.clone(),
        }
    }

    /// Connector for a peer cluster
    pub fn remote(
        cluster: &Cluster,
        client: Client,
        fleet: Arc<dyn FleetApi>,
        peer_config: Arc<dyn MeshConfigApi>,
        deps: &ConnectorDeps,
    ) -> Self {
        Self {
            kind: Kind::Remote {
                peer_config,
                control_plane: deps.mesh_config.clone(),
            },
            geo: geo_of(cluster),
            client,
            fleet,
            bus: deps.bus.clone(),
            events: deps.events.clone(),
        }
    }
}

/// Export origin of `cluster`
pub fn geo_of(cluster: &Cluster) -> Geo {
    Geo {
        cluster_key: cluster.key(),
        gateway: cluster.spec.gateway.clone().filter(|g| !g.is_empty()),
    }
}

#[async_trait]
impl Connector for ClusterConnector {
    fn key(&self) -> ClusterKey {
        self.geo.cluster_key.clone()
    }

    fn is_local(&self) -> bool {
        matches!(self.kind, Kind::Local { .. })
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let key = self.key();
        if let Kind::Remote {
            peer_config,
            control_plane,
        } = &self.kind
        {
            let control_plane = control_plane.require()?;
            remote::ensure_managed(peer_config.as_ref(), &control_plane, &key).await?;
        }

        // Subscribe before the watcher publishes anything
        let rx = self.bus.subscribe();
        let children = cancel.child_token();
        let watcher = ExportWatcher::new(self.geo.clone(), self.fleet.clone(), self.bus.clone());
        let handler = FederationEvents::new(self.geo.clone(), self.fleet.clone(), self.events.clone());
        let tasks = vec![
            tokio::spawn(watcher.run(self.client.clone(), children.clone())),
            tokio::spawn(handler.run(rx, children.clone())),
        ];
        info!(cluster = %key, local = self.is_local(), "connector started");

        let result = match &self.kind {
            Kind::Local {
                repo,
                codebases,
                mesh_namespace,
            } => match codebases.derive(repo.as_ref()).await {
                Ok(()) => {
                    LocalSync::new(repo.clone(), codebases.clone(), mesh_namespace)
                        .run(self.client.clone(), BoundedRunner::default(), cancel.clone())
                        .await
                }
                Err(e) => Err(e),
            },
            Kind::Remote { .. } => {
                cancel.cancelled().await;
                Ok(())
            }
        };

        children.cancel();
        futures::future::join_all(tasks).await;
        match &result {
            Ok(()) => info!(cluster = %key, "connector stopped"),
            Err(e) => warn!(cluster = %key, error = %e, "connector failed"),
        }
        result
    }

    async fn service_import_exists(&self, export: &ServiceExport) -> Result<bool> {
        Ok(self
            .fleet
            .get_service_import(&export.namespace().unwrap_or_default(), &export.name_any())
            .await?
            .is_some())
    }

    async fn validate_service_export(
        &self,
        export: &ServiceExport,
        service: &Service,
    ) -> Result<()> {
        fleet::validate_against(self.fleet.as_ref(), export, service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshfleet_common::crd::{ClusterMode, ClusterSpec};
    use meshfleet_common::mesh_config::sample_json;
    use meshfleet_repo::MemoryRepoClient;

    fn cluster(name: &str, mode: ClusterMode) -> Cluster {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "mode": mode.to_string(),
            "region": "us",
            "zone": "east-1",
            "group": "prod",
            "gateway": "10.0.1.20:8091",
        }))
        .unwrap();
        Cluster::new(name, spec)
    }

    fn config(gateway_api: bool) -> MeshConfig {
        let mut config = MeshConfig::parse(sample_json()).unwrap();
        config.gateway_api.enabled = gateway_api;
        config
    }

    #[test]
    fn home_cluster_uses_mesh_config_paths() {
        let codebases =
            ClusterCodebases::for_cluster(&cluster("local", ClusterMode::InCluster), &config(false));
        assert_eq!(codebases.services, "/local/services");
        assert_eq!(codebases.ingress, "/local/ingress");
        assert_eq!(codebases.gateways, None);
    }

    #[test]
    fn peers_use_cluster_key_paths() {
        let codebases =
            ClusterCodebases::for_cluster(&cluster("east", ClusterMode::OutCluster), &config(true));
        assert_eq!(codebases.services, "/us/east-1/prod/east/services");
        assert_eq!(codebases.ingress, "/us/east-1/prod/east/ingress");
        assert_eq!(
            codebases.gateways.as_deref(),
            Some("/us/east-1/prod/east/gateways")
        );
    }

    #[tokio::test]
    async fn derivation_is_idempotent() {
        let repo = MemoryRepoClient::new();
        for base in [SERVICES_BASE_PATH, INGRESS_BASE_PATH, GATEWAYS_BASE_PATH] {
            repo.create_codebase(base).await.unwrap();
        }
        let codebases =
            ClusterCodebases::for_cluster(&cluster("east", ClusterMode::OutCluster), &config(true));

        codebases.derive(&repo).await.unwrap();
        let version = repo.version("/us/east-1/prod/east/services");
        codebases.derive(&repo).await.unwrap();
        assert_eq!(repo.version("/us/east-1/prod/east/services"), version);
        assert!(repo.version("/us/east-1/prod/east/gateways").is_some());
    }

    #[tokio::test]
    async fn missing_base_is_not_retried_forever() {
        let repo = MemoryRepoClient::new();
        let codebases =
            ClusterCodebases::for_cluster(&cluster("local", ClusterMode::InCluster), &config(false));
        assert!(codebases.derive(&repo).await.is_err());
    }

    #[test]
    fn geo_drops_empty_gateway() {
        let mut c = cluster("east", ClusterMode::OutCluster);
        assert_eq!(geo_of(&c).gateway.as_deref(), Some("10.0.1.20:8091"));
        c.spec.gateway = Some(String::new());
        assert_eq!(geo_of(&c).gateway, None);
    }
}
