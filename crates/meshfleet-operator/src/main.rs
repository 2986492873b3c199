//! meshfleet manager - mesh control plane for a fleet of clusters

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;

use meshfleet_common::events::{EventPublisher, KubeEventPublisher};
use meshfleet_common::kube_utils::create_client;
use meshfleet_common::telemetry::{init_telemetry, TelemetryConfig};
use meshfleet_config::listeners::{default_listeners, KubeListenerClient, ListenerContext};
use meshfleet_config::{ArchonCertManager, CertManager, KubeCaStore, KubeMeshConfigApi, MeshConfigStore};
use meshfleet_connector::{
    ConnectorDeps, KubeConnectorFactory, KubeSupervisorApi, MessageBus, Supervisor,
    SupervisorParts,
};
use meshfleet_operator::bootstrap::{Bootstrap, KubeBootstrapApi};
use meshfleet_operator::config::{ManagerConfig, OsEnv};
use meshfleet_operator::controller_runner::{
    build_gateway_controllers, build_namespaced_ingress_controllers,
    build_proxy_profile_controllers, build_service_lb_controllers, build_supervisor_controllers,
};
use meshfleet_operator::crds::{crd_manifests, install_crds};
use meshfleet_operator::gateway::{GatewayContext, KubeGatewayApi};
use meshfleet_operator::health::{serve_health, Readiness};
use meshfleet_operator::namespaced_ingress::{KubeNsigApi, NsigContext};
use meshfleet_operator::proxy_profile::{KubeProfileApi, ProfileContext};
use meshfleet_operator::service_lb::{KubeServiceLbApi, ServiceLbContext};
use meshfleet_operator::startup::{
    cancel_on_signal, load_mesh_config, repo_client, MESH_CONFIG_POLL_INTERVAL,
};
use meshfleet_webhook::adapters;
use meshfleet_webhook::{serve, KubeAdmissionLookup, WebhookEndpoint, WebhookServerConfig};

/// Capacity of the federation message bus
const BUS_CAPACITY: usize = 1024;

/// meshfleet manager - CRD-driven service mesh control plane
#[derive(Parser, Debug)]
#[command(name = "meshfleet-manager", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// YAML configuration file; MESHFLEET_* variables override it
    #[arg(long, env = "MESHFLEET_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The webhook server and kube clients cannot use TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        match crd_manifests() {
            Ok(manifests) => {
                print!("{manifests}");
                return;
            }
            Err(e) => {
                eprintln!("failed to render CRDs: {e}");
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = init_telemetry(TelemetryConfig {
        service_name: "meshfleet-manager".to_string(),
        ..Default::default()
    }) {
        eprintln!("failed to initialize telemetry: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        tracing::error!(error = ?e, "meshfleet manager failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ManagerConfig::load(cli.config.as_deref(), &OsEnv)?;
    let client = create_client(None).await?;

    if config.install_crds {
        install_crds(&client).await?;
    }

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

    // Listeners and the repo client are built from the first document
    let wait = Duration::from_secs(config.mesh_config_timeout_secs);
    let mesh_api = KubeMeshConfigApi::new(client.clone(), &config.namespace);
    let initial = load_mesh_config(&mesh_api, wait, MESH_CONFIG_POLL_INTERVAL).await?;
    let repo = repo_client(&initial)?;
    let ca_store = KubeCaStore::from_mesh_config(client.clone(), &initial, &config.namespace);
    let certs: Arc<dyn CertManager> = Arc::new(ArchonCertManager::with_kind(
        Arc::new(ca_store),
        initial.certificate.manager,
    ));

    let listeners = default_listeners(&ListenerContext {
        repo: repo.clone(),
        kube: Arc::new(KubeListenerClient::new(client.clone(), &config.namespace)),
        certs: certs.clone(),
        mesh_namespace: config.namespace.clone(),
    });
    let store = Arc::new(MeshConfigStore::new(listeners));
    tokio::spawn(
        store
            .clone()
            .run(client.clone(), config.namespace.clone(), cancel.clone()),
    );
    let mesh_config = store.wait_loaded(wait).await?;
    tracing::info!(cluster = %mesh_config.cluster_key(), "mesh config loaded");

    start_webhooks(&client, &config, store.clone(), certs, cancel.clone()).await?;

    let bootstrap = Arc::new(Bootstrap::new(
        repo.clone(),
        Arc::new(KubeBootstrapApi::new(client.clone())),
        store.clone(),
    ));
    bootstrap.run(&readiness).await?;
    tokio::spawn(bootstrap.run_rebuild_job(cancel.clone()));

    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), "meshfleet-manager"));
    let bus = MessageBus::new(BUS_CAPACITY);
    let deps = ConnectorDeps {
        bus: bus.clone(),
        events: events.clone(),
        repo: repo.clone(),
        mesh_config: store.clone(),
        mesh_namespace: config.namespace.clone(),
    };
    let supervisor = Arc::new(Supervisor::new(SupervisorParts {
        kube: Arc::new(KubeSupervisorApi::new(client.clone(), &config.namespace)),
        factory: Arc::new(KubeConnectorFactory::new(client.clone(), deps)),
        repo: repo.clone(),
        mesh_config: store.clone(),
        bus,
        events: events.clone(),
        kubeconfig_dir: config.kubeconfig_dir.clone(),
        root: cancel.child_token(),
    }));

    tracing::info!("Starting controllers:");
    let mut controllers =
        build_supervisor_controllers(client.clone(), supervisor.clone(), cancel.clone());
    controllers.extend(build_proxy_profile_controllers(
        client.clone(),
        Arc::new(ProfileContext {
            kube: Arc::new(KubeProfileApi::new(client.clone())),
            repo: repo.clone(),
            mesh_config: store.clone(),
            events,
        }),
    ));
    if mesh_config.namespaced_ingress.enabled {
        controllers.extend(build_namespaced_ingress_controllers(
            client.clone(),
            Arc::new(NsigContext {
                kube: Arc::new(KubeNsigApi::new(client.clone())),
                repo: repo.clone(),
                mesh_config: store.clone(),
            }),
        ));
    }
    if mesh_config.service_lb.enabled {
        controllers.extend(build_service_lb_controllers(
            client.clone(),
            Arc::new(ServiceLbContext {
                kube: Arc::new(KubeServiceLbApi::new(client.clone())),
                mesh_config: store.clone(),
            }),
        ));
    }
    if mesh_config.gateway_api.enabled {
        controllers.extend(build_gateway_controllers(
            client.clone(),
            Arc::new(GatewayContext::new(
                Arc::new(KubeGatewayApi::new(client.clone())),
                repo,
                store.clone(),
            )),
        ));
    }

    futures::future::join_all(controllers).await;

    cancel.cancel();
    supervisor.shutdown().await;
    tracing::info!("meshfleet manager shutting down");
    Ok(())
}

/// Register the webhook configurations and start the HTTPS server
async fn start_webhooks(
    client: &Client,
    config: &ManagerConfig,
    store: Arc<MeshConfigStore>,
    certs: Arc<dyn CertManager>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let registry = Arc::new(adapters::registry(
        Arc::new(KubeAdmissionLookup::new(client.clone())),
        store,
    ));
    let endpoint = WebhookEndpoint {
        service_name: config.webhook.service_name.clone(),
        namespace: config.namespace.clone(),
        port: config.webhook.service_port,
        ca_bundle: certs.ca_bundle().await?,
    };
    registry
        .install(client.clone(), &config.webhook.configuration_name, &endpoint)
        .await?;

    let server_config = WebhookServerConfig {
        addr: config.webhook_addr(),
        service_name: config.webhook.service_name.clone(),
        namespace: config.namespace.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = serve(registry, certs, server_config, cancel).await {
            tracing::error!(error = %e, "webhook server stopped");
        }
    });
    Ok(())
}
