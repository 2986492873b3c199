//! NamespacedIngress reconciler
//!
//! Each NamespacedIngress gets its own ingress proxy: a codebase derived from
//! the cluster ingress codebase plus an owned ServiceAccount, Deployment and
//! Service in the namespace. The proxy only routes Ingresses of that
//! namespace.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServiceAccount,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::crd::{
    condition_types, set_condition, Condition, ConditionStatus, NamespacedIngress,
    NamespacedIngressStatus,
};
use meshfleet_common::kube_utils::{ignore_not_found, patch_resource_status};
use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{Error, Result, FIELD_MANAGER, PART_OF_LABEL, PART_OF_VALUE};
use meshfleet_config::MeshConfigStore;
use meshfleet_repo::RepoClient;

const RESYNC_INTERVAL: Duration = Duration::from_secs(60);
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// Env var telling the proxy which namespace it serves
pub const WATCH_NAMESPACE_ENV: &str = "MESHFLEET_INGRESS_NAMESPACE";

/// Cluster access of the NamespacedIngress reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NsigKube: Send + Sync {
    /// Server-side apply the ServiceAccount
    async fn apply_service_account(&self, account: &ServiceAccount) -> Result<()>;
    /// Server-side apply the Deployment
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<()>;
    /// Server-side apply the Service
    async fn apply_service(&self, service: &Service) -> Result<()>;
    /// Ready replicas of Deployment `name`; `None` when it is missing
    async fn ready_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>>;
    /// Merge-patch the status
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NamespacedIngressStatus,
    ) -> Result<()>;
}

/// [`NsigKube`] over the API server
pub struct KubeNsigApi {
    client: Client,
}

impl KubeNsigApi {
    /// Talks to the cluster through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply<K>(&self, object: &K) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::Serialize
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = object.namespace().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &object.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NsigKube for KubeNsigApi {
    async fn apply_service_account(&self, account: &ServiceAccount) -> Result<()> {
        self.apply(account).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.apply(deployment).await
    }

    async fn apply_service(&self, service: &Service) -> Result<()> {
        self.apply(service).await
    }

    async fn ready_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(ignore_not_found(api.get(name).await)?.map(|d| {
            d.status
                .and_then(|s| s.ready_replicas)
                .unwrap_or_default()
        }))
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NamespacedIngressStatus,
    ) -> Result<()> {
        patch_resource_status::<NamespacedIngress>(
            &self.client,
            name,
            namespace,
            status,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }
}

/// Shared state of the NamespacedIngress controller
pub struct NsigContext {
    /// Cluster access
    pub kube: Arc<dyn NsigKube>,
    /// Repo the ingress codebase lives in
    pub repo: Arc<dyn RepoClient>,
    /// Current mesh config
    pub mesh_config: Arc<MeshConfigStore>,
}

/// Resources deployed for one NamespacedIngress
#[derive(Clone, Debug)]
pub struct NsigResources {
    /// Identity of the proxy pods
    pub service_account: ServiceAccount,
    /// The proxy
    pub deployment: Deployment,
    /// Its entry point
    pub service: Service,
}

fn labels(nsig: &NamespacedIngress) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), nsig.workload_name()),
        (PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string()),
    ])
}

fn metadata(nsig: &NamespacedIngress, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: nsig.namespace(),
        labels: Some(labels(nsig)),
        owner_references: nsig.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

/// Listener ports as `(name, port, node port)`
fn listeners(nsig: &NamespacedIngress) -> Vec<(&'static str, i32, Option<i32>)> {
    let mut ports = Vec::new();
    if let Some(http) = nsig.spec.http.as_ref().filter(|h| h.enabled) {
        ports.push(("http", http.port, http.node_port));
    }
    if let Some(tls) = nsig.spec.tls.as_ref().filter(|t| t.enabled) {
        ports.push(("https", tls.port, tls.node_port));
    }
    ports
}

/// Build the ServiceAccount, Deployment and Service of `nsig`
pub fn build_resources(nsig: &NamespacedIngress, config: &MeshConfig) -> NsigResources {
    let name = nsig.workload_name();
    let namespace = nsig.namespace().unwrap_or_default();
    let account_name = nsig
        .spec
        .service_account_name
        .clone()
        .unwrap_or_else(|| name.clone());
    let codebase = config.namespaced_ingress_codebase_path(&namespace);
    let ports = listeners(nsig);

    let mut args = vec![format!("{}{}/", config.repo_base_url(), codebase)];
    if let Some(level) = nsig.spec.log_level {
        args.push(format!("--log-level={level}"));
    }

    let container = Container {
        name: "ingress".to_string(),
        image: Some(config.proxy_image()),
        args: Some(args),
        env: Some(vec![EnvVar {
            name: WATCH_NAMESPACE_ENV.to_string(),
            value: Some(namespace.clone()),
            value_from: None,
        }]),
        ports: Some(
            ports
                .iter()
                .map(|(port_name, port, _)| ContainerPort {
                    name: Some(port_name.to_string()),
                    container_port: *port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        security_context: nsig.spec.security_context.clone(),
        ..Default::default()
    };

    let deployment = Deployment {
        metadata: metadata(nsig, &name),
        spec: Some(DeploymentSpec {
            replicas: Some(nsig.spec.replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(labels(nsig)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(nsig)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(account_name.clone()),
                    containers: vec![container],
                    node_selector: (!nsig.spec.node_selector.is_empty())
                        .then(|| nsig.spec.node_selector.clone()),
                    security_context: nsig.spec.pod_security_context.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let node_ports_allowed = nsig.spec.service_type != "ClusterIP";
    let service = Service {
        metadata: metadata(nsig, &name),
        spec: Some(ServiceSpec {
            type_: Some(nsig.spec.service_type.clone()),
            selector: Some(labels(nsig)),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port, node_port)| ServicePort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*port)),
                        node_port: node_port.filter(|_| node_ports_allowed),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };

    NsigResources {
        service_account: ServiceAccount {
            metadata: metadata(nsig, &account_name),
            ..Default::default()
        },
        deployment,
        service,
    }
}

/// Reconcile one NamespacedIngress
#[instrument(skip(nsig, ctx), fields(namespace = %nsig.namespace().unwrap_or_default()))]
pub async fn reconcile(nsig: Arc<NamespacedIngress>, ctx: Arc<NsigContext>) -> Result<Action> {
    let config = ctx.mesh_config.require()?;
    if !config.namespaced_ingress.enabled {
        debug!("namespaced ingress disabled in the mesh config");
        return Ok(Action::await_change());
    }
    let namespace = nsig.namespace().ok_or_else(|| {
        Error::validation_for("NamespacedIngress", "NamespacedIngress must be namespaced")
    })?;

    let codebase = config.namespaced_ingress_codebase_path(&namespace);
    ctx.repo
        .derive_codebase(&codebase, &config.ingress_codebase_path())
        .await?;

    let resources = build_resources(&nsig, &config);
    ctx.kube
        .apply_service_account(&resources.service_account)
        .await?;
    ctx.kube.apply_deployment(&resources.deployment).await?;
    ctx.kube.apply_service(&resources.service).await?;

    let name = nsig.workload_name();
    let replicas = ctx
        .kube
        .ready_replicas(&namespace, &name)
        .await?
        .unwrap_or_default();
    let current = nsig.status.clone().unwrap_or_default();
    let mut status = NamespacedIngressStatus {
        replicas,
        conditions: current.conditions.clone(),
    };
    let (ready, reason, message) = if replicas > 0 {
        (ConditionStatus::True, "Available", format!("{replicas} replicas ready"))
    } else {
        (ConditionStatus::False, "Progressing", "no replica is ready yet".to_string())
    };
    set_condition(
        &mut status.conditions,
        Condition::new(condition_types::READY, ready, reason, message),
    );
    if status != current {
        ctx.kube
            .patch_status(&namespace, &nsig.name_any(), &status)
            .await?;
        info!(%namespace, replicas, "namespaced ingress status updated");
    }
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Requeue a failed reconcile
pub fn error_policy(nsig: Arc<NamespacedIngress>, error: &Error, _ctx: Arc<NsigContext>) -> Action {
    error!(
        ?error,
        namespace = %nsig.namespace().unwrap_or_default(),
        "namespaced ingress reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}
