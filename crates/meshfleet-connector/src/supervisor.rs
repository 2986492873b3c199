//! Connector supervisor
//!
//! Keeps exactly one running connector per Cluster record whose spec hash
//! matches the record. Connectors run as tasks under a child token of the
//! supervisor's root token. The same lock that guards the connector map
//! serializes federation decisions, so a decision never sees a connector
//! set that is halfway through a restart.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::Kubeconfig;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::crd::{
    condition_types, set_condition, Cluster, ClusterKey, ClusterStatus, Condition,
    ConditionStatus,
};
use meshfleet_common::events::{actions, reasons, EventPublisher};
use meshfleet_common::kube_utils::client_from_kubeconfig;
use meshfleet_common::retry::{retry_with_fibonacci_if, RetryConfig};
use meshfleet_common::{Error, Result, FIELD_MANAGER};
use meshfleet_config::{KubeMeshConfigApi, MeshConfigStore};
use meshfleet_repo::RepoClient;

use crate::bus::{Message, MessageBus, MessageKind};
use crate::connector::{ClusterCodebases, ClusterConnector, Connector, ConnectorDeps};
use crate::federation::{self, Decision};
use crate::fleet::KubeFleetApi;
use crate::WATCH_TIMEOUT_SECS;

/// Every Cluster is revisited this often so a dropped connector comes back
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Requeue delay after a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// Attempts per federation decision
const DECISION_ATTEMPTS: u32 = 8;

/// Key holding the kubeconfig in a credentials Secret
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Object Store operations of the supervisor on the home cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SupervisorKube: Send + Sync {
    /// Every Cluster record
    async fn list_clusters(&self) -> Result<Vec<Cluster>>;

    /// Store `kubeconfig` in the Cluster's credentials Secret, owned by the
    /// Cluster; returns `namespace/name` of the Secret
    async fn apply_credentials(&self, cluster: &Cluster, kubeconfig: &str) -> Result<String>;

    /// Replace the status of Cluster `name`
    async fn patch_status(&self, name: &str, status: &ClusterStatus) -> Result<()>;
}

/// [`SupervisorKube`] over the home cluster's API server
pub struct KubeSupervisorApi {
    client: Client,
    namespace: String,
}

impl KubeSupervisorApi {
    /// Credentials Secrets go to `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl SupervisorKube for KubeSupervisorApi {
    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn apply_credentials(&self, cluster: &Cluster, kubeconfig: &str) -> Result<String> {
        let name = cluster.credentials_secret_name();
        let owner = OwnerReference {
            api_version: Cluster::api_version(&()).to_string(),
            kind: Cluster::kind(&()).to_string(),
            name: cluster.name_any(),
            uid: cluster.uid().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let mut secret = Secret {
            string_data: Some(BTreeMap::from([(
                KUBECONFIG_KEY.to_string(),
                kubeconfig.to_string(),
            )])),
            ..Default::default()
        };
        secret.metadata.name = Some(name.clone());
        secret.metadata.namespace = Some(self.namespace.clone());
        secret.metadata.owner_references = Some(vec![owner]);

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        Ok(format!("{}/{}", self.namespace, name))
    }

    async fn patch_status(&self, name: &str, status: &ClusterStatus) -> Result<()> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Builds the connector of a Cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Connector for `cluster`; OutClusters come with the path of their
    /// materialized kubeconfig
    async fn build(
        &self,
        cluster: &Cluster,
        kubeconfig: Option<PathBuf>,
    ) -> Result<Arc<dyn Connector>>;
}

/// [`ConnectorFactory`] producing [`ClusterConnector`]s
pub struct KubeConnectorFactory {
    client: Client,
    deps: ConnectorDeps,
}

impl KubeConnectorFactory {
    /// Home cluster connectors use `client`
    pub fn new(client: Client, deps: ConnectorDeps) -> Self {
        Self { client, deps }
    }
}

#[async_trait]
impl ConnectorFactory for KubeConnectorFactory {
    async fn build(
        &self,
        cluster: &Cluster,
        kubeconfig: Option<PathBuf>,
    ) -> Result<Arc<dyn Connector>> {
        match kubeconfig {
            None => {
                let config = self.deps.mesh_config.require()?;
                let codebases = ClusterCodebases::for_cluster(cluster, &config);
                Ok(Arc::new(ClusterConnector::local(
                    cluster,
                    self.client.clone(),
                    Arc::new(KubeFleetApi::new(self.client.clone())),
                    &self.deps,
                    codebases,
                )))
            }
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
                    Error::validation_for(
                        "Cluster",
                        format!("invalid kubeconfig of cluster {}: {e}", cluster.name_any()),
                    )
                })?;
                let client = client_from_kubeconfig(kubeconfig).await?;
                Ok(Arc::new(ClusterConnector::remote(
                    cluster,
                    client.clone(),
                    Arc::new(KubeFleetApi::new(client.clone())),
                    Arc::new(KubeMeshConfigApi::new(client, &self.deps.mesh_namespace)),
                    &self.deps,
                )))
            }
        }
    }
}

/// Check a kubeconfig document before it is stored
pub fn parse_kubeconfig(cluster: &str, document: &str) -> Result<Kubeconfig> {
    let kubeconfig = Kubeconfig::from_yaml(document).map_err(|e| {
        Error::validation_for("Cluster", format!("invalid kubeconfig of cluster {cluster}: {e}"))
    })?;
    if kubeconfig.clusters.is_empty() {
        return Err(Error::validation_for(
            "Cluster",
            format!("kubeconfig of cluster {cluster} names no clusters"),
        ));
    }
    Ok(kubeconfig)
}

/// One running connector
struct ConnectorBackground {
    key: ClusterKey,
    is_local: bool,
    spec_hash: String,
    cancel: CancellationToken,
    connector: Arc<dyn Connector>,
    generation: u64,
}

/// Supervises the connectors of every Cluster record
pub struct Supervisor {
    kube: Arc<dyn SupervisorKube>,
    factory: Arc<dyn ConnectorFactory>,
    repo: Arc<dyn RepoClient>,
    mesh_config: Arc<MeshConfigStore>,
    bus: MessageBus,
    events: Arc<dyn EventPublisher>,
    kubeconfig_dir: PathBuf,
    root: CancellationToken,
    backgrounds: Mutex<HashMap<String, ConnectorBackground>>,
    generation: AtomicU64,
    decision_retry: RetryConfig,
}

/// Everything a [`Supervisor`] needs
pub struct SupervisorParts {
    /// Home cluster access
    pub kube: Arc<dyn SupervisorKube>,
    /// Connector construction
    pub factory: Arc<dyn ConnectorFactory>,
    /// Repo client for codebase derivation
    pub repo: Arc<dyn RepoClient>,
    /// Control plane mesh config
    pub mesh_config: Arc<MeshConfigStore>,
    /// Federation bus
    pub bus: MessageBus,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Directory kubeconfigs are written to
    pub kubeconfig_dir: PathBuf,
    /// Cancelled on shutdown
    pub root: CancellationToken,
}

impl Supervisor {
    /// Supervisor with no running connectors
    pub fn new(parts: SupervisorParts) -> Self {
        Self {
            kube: parts.kube,
            factory: parts.factory,
            repo: parts.repo,
            mesh_config: parts.mesh_config,
            bus: parts.bus,
            events: parts.events,
            kubeconfig_dir: parts.kubeconfig_dir,
            root: parts.root,
            backgrounds: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            decision_retry: RetryConfig::with_max_attempts(DECISION_ATTEMPTS),
        }
    }

    /// Override the retry schedule of federation decisions
    pub fn with_decision_retry(mut self, retry: RetryConfig) -> Self {
        self.decision_retry = retry;
        self
    }

    /// Names and spec hashes of running connectors
    pub async fn running(&self) -> BTreeMap<String, String> {
        self.backgrounds
            .lock()
            .await
            .iter()
            .map(|(name, bg)| (name.clone(), bg.spec_hash.clone()))
            .collect()
    }

    /// Running connectors
    pub async fn connectors(&self) -> Vec<Arc<dyn Connector>> {
        self.backgrounds
            .lock()
            .await
            .values()
            .map(|bg| bg.connector.clone())
            .collect()
    }

    /// Bring the connector of Cluster `name` in line with `cluster`.
    ///
    /// `None` stops the connector. An unchanged spec hash is a no-op; a
    /// changed one replaces the connector.
    pub async fn sync_cluster(self: &Arc<Self>, name: &str, cluster: Option<&Cluster>) -> Result<()> {
        let mut backgrounds = self.backgrounds.lock().await;

        let Some(cluster) = cluster else {
            if let Some(bg) = backgrounds.remove(name) {
                bg.cancel.cancel();
                info!(cluster = %name, key = %bg.key, "cluster removed, connector stopped");
            }
            return self.remove_kubeconfig(name).await;
        };

        let spec_hash = cluster.spec.spec_hash()?;
        if let Some(bg) = backgrounds.get(name) {
            if bg.spec_hash == spec_hash {
                return Ok(());
            }
            info!(cluster = %name, "cluster spec changed, restarting connector");
        }
        if let Some(old) = backgrounds.remove(name) {
            old.cancel.cancel();
        }

        let bg = self.start(name, cluster, spec_hash).await?;
        backgrounds.insert(name.to_string(), bg);
        Ok(())
    }

    async fn start(
        self: &Arc<Self>,
        name: &str,
        cluster: &Cluster,
        spec_hash: String,
    ) -> Result<ConnectorBackground> {
        let config = self.mesh_config.require()?;
        ClusterCodebases::for_cluster(cluster, &config)
            .derive(self.repo.as_ref())
            .await?;

        let mut status = cluster.status.clone().unwrap_or_default();
        let kubeconfig = if cluster.is_in_cluster() {
            None
        } else {
            let document = cluster
                .spec
                .kubeconfig
                .as_deref()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    Error::validation_for_field(
                        "Cluster",
                        "spec.kubeconfig",
                        format!("OutCluster {name} requires a kubeconfig"),
                    )
                })?;
            parse_kubeconfig(name, document)?;
            status.secret = Some(self.kube.apply_credentials(cluster, document).await?);
            Some(self.write_kubeconfig(name, document).await?)
        };

        let connector = self.factory.build(cluster, kubeconfig).await?;
        let cancel = self.root.child_token();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let bg = ConnectorBackground {
            key: cluster.key(),
            is_local: connector.is_local(),
            spec_hash,
            cancel: cancel.clone(),
            connector: connector.clone(),
            generation,
        };

        set_condition(
            &mut status.conditions,
            Condition::new(
                condition_types::CONNECTED,
                ConditionStatus::True,
                reasons::CONNECTOR_STARTED,
                format!("connector for {} started", bg.key),
            ),
        );
        if let Err(e) = self.kube.patch_status(name, &status).await {
            warn!(cluster = %name, error = %e, "failed to update cluster status");
        }
        self.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reasons::CONNECTOR_STARTED,
                actions::RECONCILE,
                Some(format!("connector for {} started", bg.key)),
            )
            .await;

        let supervisor = Arc::clone(self);
        let cluster_ref = cluster.object_ref(&());
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = connector.run(cancel.clone()).await {
                error!(cluster = %name, error = %e, "connector exited");
                cancel.cancel();
                supervisor
                    .events
                    .publish(
                        &cluster_ref,
                        EventType::Warning,
                        reasons::CONNECTOR_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
                supervisor.forget(&name, generation).await;
            }
        });

        info!(cluster = %bg.key, local = bg.is_local, generation, "connector started");
        Ok(bg)
    }

    /// Drop the entry of `name` if it still belongs to `generation`
    async fn forget(&self, name: &str, generation: u64) {
        let mut backgrounds = self.backgrounds.lock().await;
        if backgrounds.get(name).is_some_and(|bg| bg.generation == generation) {
            backgrounds.remove(name);
            debug!(cluster = %name, generation, "failed connector removed");
        }
    }

    async fn write_kubeconfig(&self, name: &str, document: &str) -> Result<PathBuf> {
        let path = kubeconfig_path(&self.kubeconfig_dir, name);
        tokio::fs::create_dir_all(&self.kubeconfig_dir)
            .await
            .map_err(|e| Error::internal_with_context("kubeconfig", e.to_string()))?;
        tokio::fs::write(&path, document)
            .await
            .map_err(|e| Error::internal_with_context("kubeconfig", e.to_string()))?;
        Ok(path)
    }

    async fn remove_kubeconfig(&self, name: &str) -> Result<()> {
        let path = kubeconfig_path(&self.kubeconfig_dir, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(cluster = %name, path = %path.display(), "kubeconfig removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::internal_with_context("kubeconfig", e.to_string())),
        }
    }

    /// Reject a second InCluster record and stop connectors of records that
    /// no longer exist
    pub async fn check_fleet(self: &Arc<Self>, cluster: &Cluster) -> Result<()> {
        let clusters = self.kube.list_clusters().await?;

        let stale: Vec<String> = {
            let backgrounds = self.backgrounds.lock().await;
            backgrounds
                .keys()
                .filter(|name| !clusters.iter().any(|c| &c.name_any() == *name))
                .cloned()
                .collect()
        };
        for name in stale {
            self.sync_cluster(&name, None).await?;
        }

        if cluster.is_in_cluster() {
            let others: Vec<String> = clusters
                .iter()
                .filter(|c| c.is_in_cluster() && c.name_any() != cluster.name_any())
                .map(|c| c.name_any())
                .collect();
            if !others.is_empty() {
                return Err(Error::validation_for(
                    "Cluster",
                    format!(
                        "only one InCluster Cluster is allowed, {} already exists",
                        others.join(", ")
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Decide on a `ServiceExportCreated` message and publish the outcome
    pub async fn federate(&self, message: &Message) -> Result<()> {
        let Some(service) = message.service.as_ref() else {
            return Ok(());
        };
        let is_control_plane = self
            .mesh_config
            .current()
            .is_some_and(|c| c.is_control_plane());

        let backgrounds = self.backgrounds.lock().await;
        let connectors: Vec<Arc<dyn Connector>> =
            backgrounds.values().map(|bg| bg.connector.clone()).collect();

        let decision = retry_with_fibonacci_if(
            &self.decision_retry,
            &format!("federate {}", message.service_export.key()),
            |e: &Error| e.is_retryable(),
            || {
                federation::evaluate(
                    is_control_plane,
                    &connectors,
                    &message.geo.cluster_key,
                    &message.service_export,
                    service,
                )
            },
        )
        .await?;

        let export = message.service_export.clone();
        match decision {
            Decision::Accepted => self.bus.publish(
                Message::new(MessageKind::ServiceExportAccepted, message.geo.clone(), export)
                    .with_service(service.clone()),
            ),
            Decision::Rejected(reason) => self.bus.publish(
                Message::new(MessageKind::ServiceExportRejected, message.geo.clone(), export)
                    .with_error(reason),
            ),
            Decision::Ignored => {}
        }
        drop(backgrounds);
        Ok(())
    }

    /// Consume the bus and decide on every created export until `cancel`
    /// fires
    pub async fn run_federation(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.bus.subscribe();
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "federation decisions lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if message.kind != MessageKind::ServiceExportCreated {
                continue;
            }
            if let Err(e) = self.federate(&message).await {
                error!(export = %message.service_export.key(), cluster = %message.geo.cluster_key, error = %e, "federation decision failed");
            }
        }
    }

    /// Stop connectors as soon as their Cluster is deleted
    pub async fn watch_deletions(self: Arc<Self>, client: Client, cancel: CancellationToken) {
        let api: Api<Cluster> = Api::all(client);
        let stream = watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
            .default_backoff();
        futures::pin_mut!(stream);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                Ok(Event::Delete(cluster)) => {
                    if let Err(e) = self.sync_cluster(&cluster.name_any(), None).await {
                        warn!(cluster = %cluster.name_any(), error = %e, "failed to stop connector");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cluster watch error"),
            }
        }
    }

    /// Cancel every connector and drop the materialized kubeconfigs
    pub async fn shutdown(&self) {
        let mut backgrounds = self.backgrounds.lock().await;
        for (name, bg) in backgrounds.drain() {
            bg.cancel.cancel();
            debug!(cluster = %name, "connector cancelled");
            if let Err(e) = self.remove_kubeconfig(&name).await {
                warn!(cluster = %name, error = %e, "kubeconfig not removed");
            }
        }
    }
}

/// Where the kubeconfig of Cluster `name` is materialized
pub fn kubeconfig_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.kubeconfig"))
}

/// Reconcile one Cluster
#[instrument(skip(cluster, supervisor), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, supervisor: Arc<Supervisor>) -> Result<Action> {
    supervisor.check_fleet(&cluster).await?;
    supervisor
        .sync_cluster(&cluster.name_any(), Some(&cluster))
        .await?;
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Requeue a failed reconcile
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, _supervisor: Arc<Supervisor>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "cluster reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{export, west};
    use crate::connector::MockConnector;
    use crate::fleet::testing::service;
    use meshfleet_common::crd::{ClusterMode, ClusterSpec};
    use meshfleet_common::events::NoopEventPublisher;
    use meshfleet_common::mesh_config::{sample_json, MeshConfig};
    use meshfleet_common::{GATEWAYS_BASE_PATH, INGRESS_BASE_PATH, SERVICES_BASE_PATH};
    use meshfleet_repo::MemoryRepoClient;
    use std::sync::atomic::AtomicUsize;

    const KUBECONFIG: &str = r#"apiVersion: v1
kind: Config
clusters:
- name: east
  cluster:
    server: https://10.0.1.1:6443
contexts:
- name: east
  context:
    cluster: east
    user: admin
current-context: east
users:
- name: admin
  user:
    token: abc
"#;

    fn cluster(name: &str, mode: ClusterMode, gateway: &str) -> Cluster {
        let mut spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "mode": mode.to_string(),
            "region": "us",
            "zone": "east-1",
            "group": "prod",
            "gateway": gateway,
        }))
        .unwrap();
        if mode == ClusterMode::OutCluster {
            spec.kubeconfig = Some(KUBECONFIG.to_string());
        }
        let mut c = Cluster::new(name, spec);
        c.metadata.uid = Some(format!("{name}-uid"));
        c
    }

    /// Connector that runs until cancelled, or fails at once
    fn idle_connector(key: ClusterKey, fail: bool) -> Arc<dyn Connector> {
        let mut mock = MockConnector::new();
        mock.expect_key().return_const(key);
        mock.expect_is_local().return_const(false);
        mock.expect_run().returning(move |cancel| {
            if fail {
                return Err(Error::fatal("cluster already managed"));
            }
            // The mock cannot await, so park a task on the token instead
            tokio::spawn(async move { cancel.cancelled().await });
            Ok(())
        });
        mock.expect_service_import_exists().returning(|_| Ok(false));
        mock.expect_validate_service_export().returning(|_, _| Ok(()));
        Arc::new(mock)
    }

    struct Harness {
        supervisor: Arc<Supervisor>,
        builds: Arc<AtomicUsize>,
        repo: Arc<MemoryRepoClient>,
        dir: tempfile::TempDir,
    }

    async fn harness(clusters: Vec<Cluster>, fail: bool) -> Harness {
        let repo = Arc::new(MemoryRepoClient::new());
        for base in [SERVICES_BASE_PATH, INGRESS_BASE_PATH, GATEWAYS_BASE_PATH] {
            repo.create_codebase(base).await.unwrap();
        }

        let mut kube = MockSupervisorKube::new();
        kube.expect_list_clusters()
            .returning(move || Ok(clusters.clone()));
        kube.expect_apply_credentials()
            .returning(|c, _| Ok(format!("meshfleet-system/{}", c.credentials_secret_name())));
        kube.expect_patch_status().returning(|_, _| Ok(()));

        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let mut factory = MockConnectorFactory::new();
        factory.expect_build().returning(move |cluster, kubeconfig| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(kubeconfig.is_some(), !cluster.is_in_cluster());
            Ok(idle_connector(cluster.key(), fail))
        });

        let dir = tempfile::tempdir().unwrap();
        let config = MeshConfig::parse(sample_json()).unwrap();
        let supervisor = Arc::new(Supervisor::new(SupervisorParts {
            kube: Arc::new(kube),
            factory: Arc::new(factory),
            repo: repo.clone(),
            mesh_config: Arc::new(MeshConfigStore::with_config(config)),
            bus: MessageBus::new(16),
            events: Arc::new(NoopEventPublisher),
            kubeconfig_dir: dir.path().to_path_buf(),
            root: CancellationToken::new(),
        }));
        Harness {
            supervisor,
            builds,
            repo,
            dir,
        }
    }

    // ===================================================================
    // Story: a peer joins, changes its gateway, and leaves
    // ===================================================================

    #[tokio::test]
    async fn connector_follows_cluster_lifecycle() {
        let east_cluster = cluster("east", ClusterMode::OutCluster, "10.0.1.20:8091");
        let h = harness(vec![east_cluster.clone()], false).await;

        reconcile(Arc::new(east_cluster.clone()), h.supervisor.clone())
            .await
            .unwrap();
        let running = h.supervisor.running().await;
        assert_eq!(running["east"], east_cluster.spec.spec_hash().unwrap());
        assert!(h.repo.version("/us/east-1/prod/east/services").is_some());
        let written = std::fs::read_to_string(kubeconfig_path(h.dir.path(), "east")).unwrap();
        assert_eq!(written, KUBECONFIG);

        // Same spec: nothing is rebuilt
        reconcile(Arc::new(east_cluster.clone()), h.supervisor.clone())
            .await
            .unwrap();
        assert_eq!(h.builds.load(Ordering::SeqCst), 1);

        // New gateway: the connector is replaced
        let mut moved = east_cluster.clone();
        moved.spec.gateway = Some("10.0.1.99:8091".to_string());
        h.supervisor.sync_cluster("east", Some(&moved)).await.unwrap();
        assert_eq!(h.builds.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.supervisor.running().await["east"],
            moved.spec.spec_hash().unwrap()
        );

        h.supervisor.sync_cluster("east", None).await.unwrap();
        assert!(h.supervisor.running().await.is_empty());
        assert!(!kubeconfig_path(h.dir.path(), "east").exists());

        // Already gone: removing again is fine
        h.supervisor.sync_cluster("east", None).await.unwrap();
    }

    #[tokio::test]
    async fn second_in_cluster_record_is_rejected() {
        let local = cluster("local", ClusterMode::InCluster, "");
        let other = cluster("home", ClusterMode::InCluster, "");
        let h = harness(vec![local.clone(), other.clone()], false).await;

        let err = reconcile(Arc::new(other), h.supervisor.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only one InCluster Cluster is allowed"));
        assert!(!err.is_retryable());
        assert!(h.supervisor.running().await.is_empty());
    }

    #[tokio::test]
    async fn out_cluster_without_kubeconfig_is_invalid() {
        let mut east_cluster = cluster("east", ClusterMode::OutCluster, "10.0.1.20:8091");
        east_cluster.spec.kubeconfig = None;
        let h = harness(vec![east_cluster.clone()], false).await;

        let err = h
            .supervisor
            .sync_cluster("east", Some(&east_cluster))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires a kubeconfig"));
    }

    #[tokio::test]
    async fn records_gone_from_the_store_are_swept() {
        let east_cluster = cluster("east", ClusterMode::OutCluster, "10.0.1.20:8091");
        let local = cluster("local", ClusterMode::InCluster, "");
        let h = harness(vec![local.clone()], false).await;

        h.supervisor
            .sync_cluster("east", Some(&east_cluster))
            .await
            .unwrap();
        reconcile(Arc::new(local), h.supervisor.clone()).await.unwrap();

        let running = h.supervisor.running().await;
        assert!(running.contains_key("local"));
        assert!(!running.contains_key("east"));
    }

    #[tokio::test]
    async fn failed_connector_removes_itself() {
        let east_cluster = cluster("east", ClusterMode::OutCluster, "10.0.1.20:8091");
        let h = harness(vec![east_cluster.clone()], true).await;

        h.supervisor
            .sync_cluster("east", Some(&east_cluster))
            .await
            .unwrap();
        for _ in 0..50 {
            if h.supervisor.running().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.supervisor.running().await.is_empty());

        // The next resync brings it back
        h.supervisor
            .sync_cluster("east", Some(&east_cluster))
            .await
            .unwrap();
        assert_eq!(h.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn accepted_exports_are_published_with_their_service() {
        let h = harness(vec![], false).await;
        h.supervisor
            .sync_cluster("east", Some(&cluster("east", ClusterMode::OutCluster, "10.0.1.20:8091")))
            .await
            .unwrap();

        let mut rx = h.supervisor.bus.subscribe();
        let created = Message::new(
            MessageKind::ServiceExportCreated,
            west(),
            export("shop", "cart", 80),
        )
        .with_service(service("shop", "cart", "ClusterIP", &[(80, "TCP")]));
        h.supervisor.federate(&created).await.unwrap();

        let decided = rx.recv().await.unwrap();
        assert_eq!(decided.kind, MessageKind::ServiceExportAccepted);
        assert!(decided.is_from(&west().cluster_key));
        assert!(decided.service.is_some());
    }

    #[test]
    fn malformed_kubeconfig_is_a_validation_error() {
        let err = parse_kubeconfig("east", "clusters: [").unwrap_err();
        assert!(!err.is_retryable());
        assert!(parse_kubeconfig("east", KUBECONFIG).is_ok());
    }
}
