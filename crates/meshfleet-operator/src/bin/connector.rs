//! meshfleet connector - runs the connector of one Cluster out of process

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::Api;
use tokio_util::sync::CancellationToken;

use meshfleet_common::crd::Cluster;
use meshfleet_common::events::{EventPublisher, KubeEventPublisher};
use meshfleet_common::kube_utils::create_client;
use meshfleet_common::telemetry::{init_telemetry, TelemetryConfig};
use meshfleet_config::{KubeMeshConfigApi, MeshConfigStore};
use meshfleet_connector::supervisor::{kubeconfig_path, parse_kubeconfig};
use meshfleet_connector::{
    ClusterCodebases, ConnectorDeps, ConnectorFactory, KubeConnectorFactory, MessageBus,
};
use meshfleet_operator::config::{ConnectorConfig, OsEnv};
use meshfleet_operator::health::{serve_health, Readiness};
use meshfleet_operator::startup::{
    cancel_on_signal, load_mesh_config, repo_client, MESH_CONFIG_POLL_INTERVAL,
};

const BUS_CAPACITY: usize = 256;
const MESH_CONFIG_TIMEOUT: Duration = Duration::from_secs(120);

/// meshfleet connector - watches one cluster and syncs it into the repo
#[derive(Parser, Debug)]
#[command(name = "meshfleet-connector", version, about, long_about = None)]
struct Cli {
    /// YAML configuration file; MESHFLEET_* variables override it
    #[arg(long, env = "MESHFLEET_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if let Err(e) = init_telemetry(TelemetryConfig {
        service_name: "meshfleet-connector".to_string(),
        ..Default::default()
    }) {
        eprintln!("failed to initialize telemetry: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        tracing::error!(error = ?e, "meshfleet connector failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ConnectorConfig::load(cli.config.as_deref(), &OsEnv)?;
    let client = create_client(None).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let readiness = Readiness::new();
    let health_addr = config.health_addr();
    let health_readiness = readiness.clone();
    let health_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_addr, health_readiness, health_cancel).await {
            tracing::error!(error = %e, "health server stopped");
        }
    });

    let mesh_api = KubeMeshConfigApi::new(client.clone(), &config.namespace);
    let initial = load_mesh_config(&mesh_api, MESH_CONFIG_TIMEOUT, MESH_CONFIG_POLL_INTERVAL).await?;
    let repo = repo_client(&initial)?;

    // The manager owns the listeners; this store only tracks the document
    let store = Arc::new(MeshConfigStore::new(Vec::new()));
    tokio::spawn(
        store
            .clone()
            .run(client.clone(), config.namespace.clone(), cancel.clone()),
    );
    let mesh_config = store.wait_loaded(MESH_CONFIG_TIMEOUT).await?;

    let clusters: Api<Cluster> = Api::all(client.clone());
    let cluster = clusters
        .get(&config.cluster_name)
        .await
        .with_context(|| format!("reading Cluster {}", config.cluster_name))?;

    ClusterCodebases::for_cluster(&cluster, &mesh_config)
        .derive(repo.as_ref())
        .await?;

    let kubeconfig = if cluster.is_in_cluster() {
        None
    } else {
        let document = cluster
            .spec
            .kubeconfig
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .with_context(|| format!("OutCluster {} has no kubeconfig", config.cluster_name))?;
        parse_kubeconfig(&config.cluster_name, document)?;
        let path = kubeconfig_path(&config.kubeconfig_dir, &config.cluster_name);
        tokio::fs::create_dir_all(&config.kubeconfig_dir)
            .await
            .with_context(|| format!("creating {}", config.kubeconfig_dir.display()))?;
        tokio::fs::write(&path, document)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Some(path)
    };

    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), "meshfleet-connector"));
    let deps = ConnectorDeps {
        bus: MessageBus::new(BUS_CAPACITY),
        events,
        repo,
        mesh_config: store,
        mesh_namespace: config.namespace.clone(),
    };
    let connector = KubeConnectorFactory::new(client, deps)
        .build(&cluster, kubeconfig)
        .await?;

    tracing::info!(cluster = %connector.key(), local = connector.is_local(), "connector starting");
    readiness.set(true);
    connector.run(cancel.clone()).await?;

    cancel.cancel();
    tracing::info!("meshfleet connector shutting down");
    Ok(())
}
