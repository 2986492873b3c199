//! Repo bootstrap and recovery
//!
//! On startup the manager waits for the repo server, seeds the base
//! pipelines from the scripts embedded in the binary and derives every
//! codebase the cluster writes to. The repo keeps codebases in memory, so a
//! restart of the server loses them; the rebuild job notices the missing
//! base ingress codebase and redoes the whole seed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::crd::{Cluster, NamespacedIngress, ProxyProfile};
use meshfleet_common::kube_utils::poll_until;
use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{Error, Result, GATEWAYS_BASE_PATH, INGRESS_BASE_PATH, SERVICES_BASE_PATH};
use meshfleet_config::MeshConfigStore;
use meshfleet_connector::ClusterCodebases;
use meshfleet_repo::documents::{set_value, CONFIG_DIR, INGRESS_JSON, MAIN_JSON, REGISTRY_JSON};
use meshfleet_repo::{Batch, BatchItem, RepoClient};

use crate::health::Readiness;
use crate::proxy_profile::sidecar_codebases;

/// How often startup asks whether the repo answers
pub const REPO_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long startup waits for the repo
pub const REPO_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

const INGRESS_MAIN_JS: &str = include_str!("../scripts/ingress/main.js");
const INGRESS_ROUTER_JS: &str = include_str!("../scripts/ingress/plugins/router.js");
const INGRESS_BALANCER_JS: &str = include_str!("../scripts/ingress/plugins/balancer.js");
const INGRESS_MAIN_JSON: &str = include_str!("../scripts/ingress/config/main.json");
const INGRESS_ROUTES_JSON: &str = include_str!("../scripts/ingress/config/ingress.json");
const SERVICES_MAIN_JS: &str = include_str!("../scripts/services/main.js");
const SERVICES_REGISTRY_JSON: &str = include_str!("../scripts/services/config/registry.json");
const GATEWAYS_MAIN_JS: &str = include_str!("../scripts/gateways/main.js");
const GATEWAYS_MAIN_JSON: &str = include_str!("../scripts/gateways/config/main.json");

/// Records whose codebases the bootstrap derives
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapKube: Send + Sync {
    /// Every Cluster record
    async fn list_clusters(&self) -> Result<Vec<Cluster>>;
    /// Every NamespacedIngress
    async fn list_namespaced_ingresses(&self) -> Result<Vec<NamespacedIngress>>;
    /// Every ProxyProfile
    async fn list_proxy_profiles(&self) -> Result<Vec<ProxyProfile>>;
}

/// [`BootstrapKube`] over the API server
pub struct KubeBootstrapApi {
    client: Client,
}

impl KubeBootstrapApi {
    /// Lists through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BootstrapKube for KubeBootstrapApi {
    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_namespaced_ingresses(&self) -> Result<Vec<NamespacedIngress>> {
        let api: Api<NamespacedIngress> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_proxy_profiles(&self) -> Result<Vec<ProxyProfile>> {
        let api: Api<ProxyProfile> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Base pipelines as one batch each.
///
/// The ingress `main.json` carries the listener flags of `config` so a
/// reseed after a repo restart does not fall back to the script defaults.
pub fn base_batches(config: &MeshConfig) -> Result<Vec<Batch>> {
    let ingress_main = ingress_main_json(config)?;
    Ok(vec![
        Batch {
            basepath: INGRESS_BASE_PATH.to_string(),
            items: vec![
                BatchItem::new("", "main.js", INGRESS_MAIN_JS),
                BatchItem::new("/plugins", "router.js", INGRESS_ROUTER_JS),
                BatchItem::new("/plugins", "balancer.js", INGRESS_BALANCER_JS),
                BatchItem::json(CONFIG_DIR, MAIN_JSON, &ingress_main)?,
                BatchItem::new(CONFIG_DIR, INGRESS_JSON, INGRESS_ROUTES_JSON),
            ],
        },
        Batch {
            basepath: SERVICES_BASE_PATH.to_string(),
            items: vec![
                BatchItem::new("", "main.js", SERVICES_MAIN_JS),
                BatchItem::new(CONFIG_DIR, REGISTRY_JSON, SERVICES_REGISTRY_JSON),
            ],
        },
        Batch {
            basepath: GATEWAYS_BASE_PATH.to_string(),
            items: vec![
                BatchItem::new("", "main.js", GATEWAYS_MAIN_JS),
                BatchItem::new(CONFIG_DIR, MAIN_JSON, GATEWAYS_MAIN_JSON),
            ],
        },
    ])
}

fn ingress_main_json(config: &MeshConfig) -> Result<Value> {
    let mut doc: Value = serde_json::from_str(INGRESS_MAIN_JSON)?;
    let ingress = &config.ingress;
    let http_enabled = ingress.enabled && ingress.http.enabled;
    let tls_enabled = ingress.enabled && ingress.tls.enabled;
    set_value(&mut doc, "http.enabled", json!(http_enabled))?;
    set_value(&mut doc, "http.listen", json!(ingress.http.listen))?;
    set_value(&mut doc, "tls.enabled", json!(tls_enabled))?;
    set_value(&mut doc, "tls.listen", json!(ingress.tls.listen))?;
    set_value(&mut doc, "tls.mTLS", json!(ingress.tls.mtls))?;
    set_value(
        &mut doc,
        "sslPassthrough",
        json!({
            "enabled": tls_enabled && ingress.tls.ssl_passthrough.enabled,
            "upstreamPort": ingress.tls.ssl_passthrough.upstream_port,
        }),
    )?;
    Ok(doc)
}

/// Seeds the repo and keeps it seeded
pub struct Bootstrap {
    repo: Arc<dyn RepoClient>,
    kube: Arc<dyn BootstrapKube>,
    mesh_config: Arc<MeshConfigStore>,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl Bootstrap {
    /// Bootstrap writing to `repo`
    pub fn new(
        repo: Arc<dyn RepoClient>,
        kube: Arc<dyn BootstrapKube>,
        mesh_config: Arc<MeshConfigStore>,
    ) -> Self {
        Self {
            repo,
            kube,
            mesh_config,
            poll_interval: REPO_POLL_INTERVAL,
            wait_timeout: REPO_WAIT_TIMEOUT,
        }
    }

    /// Override how long and how often startup polls the repo
    pub fn with_repo_wait(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.wait_timeout = timeout;
        self
    }

    /// Wait for the repo, seed it and mark the process ready
    pub async fn run(&self, readiness: &Readiness) -> Result<()> {
        self.wait_for_repo().await?;
        self.seed().await?;
        readiness.set(true);
        info!("repo bootstrap finished");
        Ok(())
    }

    async fn wait_for_repo(&self) -> Result<()> {
        info!(timeout = ?self.wait_timeout, "waiting for the repo server");
        let repo = self.repo.clone();
        poll_until(
            self.wait_timeout,
            self.poll_interval,
            "repo server did not come up",
            move || {
                let repo = repo.clone();
                async move { Ok(repo.is_up().await) }
            },
        )
        .await
        .map_err(|e| Error::fatal(e.to_string()))
    }

    /// Write the base pipelines and derive every codebase
    pub async fn seed(&self) -> Result<()> {
        let config = self.mesh_config.require()?;
        self.repo.batch(&base_batches(&config)?).await?;
        debug!("base pipelines written");
        self.derive_all(&config).await
    }

    async fn derive_all(&self, config: &MeshConfig) -> Result<()> {
        let mut codebases = vec![home_codebases(config)];
        for cluster in self.kube.list_clusters().await? {
            let derived = ClusterCodebases::for_cluster(&cluster, config);
            if !codebases.contains(&derived) {
                codebases.push(derived);
            }
        }
        for set in &codebases {
            set.derive(self.repo.as_ref()).await?;
        }

        if config.namespaced_ingress.enabled {
            let base = config.ingress_codebase_path();
            for nsig in self.kube.list_namespaced_ingresses().await? {
                let namespace = nsig.namespace().unwrap_or_default();
                let path = config.namespaced_ingress_codebase_path(&namespace);
                if let Err(e) = self.repo.derive_codebase(&path, &base).await {
                    warn!(%path, error = %e, "failed to derive namespaced ingress codebase");
                }
            }
        }

        for profile in self.kube.list_proxy_profiles().await? {
            for (path, parent) in sidecar_codebases(&profile, config) {
                if let Err(e) = self.repo.derive_codebase(&path, &parent).await {
                    warn!(profile = %profile.name_any(), %path, error = %e, "failed to derive sidecar codebase");
                }
            }
        }
        Ok(())
    }

    /// Reseed when the base ingress codebase is gone; true when it did
    pub async fn rebuild_once(&self) -> Result<bool> {
        if self.repo.codebase_exists(INGRESS_BASE_PATH).await? {
            return Ok(false);
        }
        warn!("base ingress codebase missing, the repo restarted; rebuilding");
        self.seed().await?;
        info!("repo rebuilt");
        Ok(true)
    }

    /// Check the repo every `repoRecoverIntervalInSeconds` until `cancel`
    /// fires
    pub async fn run_rebuild_job(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = self
                .mesh_config
                .current()
                .map(|c| c.repo_recover_interval_in_seconds)
                .unwrap_or(60);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(u64::from(interval))) => {}
            }
            if let Err(e) = self.rebuild_once().await {
                warn!(error = %e, "repo rebuild check failed");
            }
        }
    }
}

fn home_codebases(config: &MeshConfig) -> ClusterCodebases {
    ClusterCodebases {
        services: config.services_codebase_path(),
        ingress: config.ingress_codebase_path(),
        gateways: config
            .gateway_api
            .enabled
            .then(|| config.gateways_codebase_path()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshfleet_common::crd::{NamespacedIngressSpec, ProxyProfileSpec, Sidecar};
    use meshfleet_common::mesh_config::sample_json;
    use meshfleet_repo::MemoryRepoClient;

    fn config() -> MeshConfig {
        let mut config = MeshConfig::parse(sample_json()).unwrap();
        config.namespaced_ingress.enabled = true;
        config
    }

    fn nsig(namespace: &str) -> NamespacedIngress {
        let mut nsig = NamespacedIngress::new("ingress", NamespacedIngressSpec::default());
        nsig.metadata.namespace = Some(namespace.to_string());
        nsig
    }

    fn profile() -> ProxyProfile {
        ProxyProfile::new(
            "cart-proxy",
            ProxyProfileSpec {
                sidecars: vec![Sidecar {
                    name: "proxy".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    fn kube() -> MockBootstrapKube {
        let mut kube = MockBootstrapKube::new();
        kube.expect_list_clusters().returning(|| Ok(vec![]));
        kube.expect_list_namespaced_ingresses()
            .returning(|| Ok(vec![nsig("shop")]));
        kube.expect_list_proxy_profiles()
            .returning(|| Ok(vec![profile()]));
        kube
    }

    fn bootstrap(repo: Arc<MemoryRepoClient>) -> Bootstrap {
        Bootstrap::new(
            repo,
            Arc::new(kube()),
            Arc::new(MeshConfigStore::with_config(config())),
        )
        .with_repo_wait(Duration::from_millis(10), Duration::from_millis(100))
    }

    #[test]
    fn one_batch_per_pipeline() {
        let batches = base_batches(&config()).unwrap();
        let paths: Vec<&str> = batches.iter().map(|b| b.basepath.as_str()).collect();
        assert_eq!(paths, [INGRESS_BASE_PATH, SERVICES_BASE_PATH, GATEWAYS_BASE_PATH]);
        assert!(batches.iter().all(|b| !b.items.is_empty()));
    }

    #[test]
    fn ingress_main_json_follows_the_mesh_config() {
        let mut config = config();
        config.ingress.tls.enabled = true;
        config.ingress.tls.listen = 443;
        let doc = ingress_main_json(&config).unwrap();
        assert_eq!(doc["tls"]["enabled"], json!(true));
        assert_eq!(doc["tls"]["listen"], json!(443));
        assert_eq!(doc["http"]["listen"], json!(80));
        assert_eq!(doc["logLevel"], json!("info"));
    }

    // =========================================================================
    // Story: startup seeds the repo, a restart of the repo is repaired
    // =========================================================================

    #[tokio::test]
    async fn bootstrap_seeds_derives_and_turns_ready() {
        let repo = Arc::new(MemoryRepoClient::new());
        let readiness = Readiness::new();

        bootstrap(repo.clone()).run(&readiness).await.unwrap();

        assert!(readiness.is_ready());
        for base in [INGRESS_BASE_PATH, SERVICES_BASE_PATH, GATEWAYS_BASE_PATH] {
            assert_eq!(repo.commit_count(base), 1, "{base}");
        }
        let main = repo.file("/base/ingress/config/main.json").unwrap();
        assert!(main.contains("sslPassthrough"));
        for derived in [
            "/local/services",
            "/local/ingress",
            "/local/nsig/shop",
            "/local/sidecars/cart-proxy/proxy",
        ] {
            assert!(repo.version(derived).is_some(), "{derived} not derived");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_fails_when_the_repo_never_answers() {
        let repo = Arc::new(MemoryRepoClient::new());
        repo.set_up(false);
        let readiness = Readiness::new();

        let err = bootstrap(repo).run(&readiness).await.unwrap_err();
        assert!(err.to_string().contains("repo server did not come up"));
        assert!(!readiness.is_ready());
    }

    #[tokio::test]
    async fn rebuild_is_a_noop_while_the_base_exists() {
        let repo = Arc::new(MemoryRepoClient::new());
        let bootstrap = bootstrap(repo.clone());
        bootstrap.run(&Readiness::new()).await.unwrap();

        assert!(!bootstrap.rebuild_once().await.unwrap());
        assert_eq!(repo.commit_count(INGRESS_BASE_PATH), 1);
    }

    #[tokio::test]
    async fn rebuild_restores_everything_after_a_repo_restart() {
        let repo = Arc::new(MemoryRepoClient::new());
        let bootstrap = bootstrap(repo.clone());
        bootstrap.run(&Readiness::new()).await.unwrap();

        repo.clear();
        assert!(bootstrap.rebuild_once().await.unwrap());

        assert!(repo.version(INGRESS_BASE_PATH).is_some());
        assert!(repo.version("/local/ingress").is_some());
        assert!(repo.version("/local/nsig/shop").is_some());
        assert!(repo.version("/local/sidecars/cart-proxy/proxy").is_some());
    }

    #[tokio::test]
    async fn rebuild_reports_an_unreachable_repo() {
        let repo = Arc::new(MemoryRepoClient::new());
        let bootstrap = bootstrap(repo.clone());
        repo.set_up(false);
        assert!(bootstrap.rebuild_once().await.is_err());
    }
}
