//! Built-in load balancer for Services of type LoadBalancer
//!
//! Clusters without a cloud load balancer get one DaemonSet per Service.
//! Every pod binds the Service ports as host ports and forwards to the
//! Service, and the addresses of the nodes running a ready pod become the
//! Service's load balancer ingress.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, LoadBalancerIngress, Node, Pod, PodSpec,
    PodTemplateSpec, SecurityContext, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::kube_utils::ignore_not_found;
use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{Error, Result, FIELD_MANAGER, PART_OF_LABEL, PART_OF_VALUE};
use meshfleet_config::MeshConfigStore;

const RESYNC_INTERVAL: Duration = Duration::from_secs(30);
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// `loadBalancerClass` handled here; Services without a class are handled too
pub const SERVICE_LB_CLASS: &str = "meshfleet.io/service-lb";

/// Label naming the Service a load balancer pod serves
pub const SERVICE_LB_LABEL: &str = "svclb.meshfleet.io/service";

/// Cluster access of the ServiceLB reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceLbKube: Send + Sync {
    /// Server-side apply a load balancer DaemonSet
    async fn apply_daemon_set(&self, daemon_set: &DaemonSet) -> Result<()>;
    /// Delete a load balancer DaemonSet; missing is fine
    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<()>;
    /// Load balancer pods of Service `service`
    async fn lb_pods(&self, namespace: &str, service: &str) -> Result<Vec<Pod>>;
    /// Every node
    async fn nodes(&self) -> Result<Vec<Node>>;
    /// Replace `status.loadBalancer.ingress` of a Service
    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: Vec<LoadBalancerIngress>,
    ) -> Result<()>;
}

/// [`ServiceLbKube`] over the API server
pub struct KubeServiceLbApi {
    client: Client,
}

impl KubeServiceLbApi {
    /// Talks to the cluster through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceLbKube for KubeServiceLbApi {
    async fn apply_daemon_set(&self, daemon_set: &DaemonSet) -> Result<()> {
        let namespace = daemon_set.namespace().unwrap_or_default();
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &daemon_set.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(daemon_set),
        )
        .await?;
        Ok(())
    }

    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn lb_pods(&self, namespace: &str, service: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(&format!("{SERVICE_LB_LABEL}={service}")))
            .await?;
        Ok(list.items)
    }

    async fn nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: Vec<LoadBalancerIngress>,
    ) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": { "loadBalancer": { "ingress": ingress } } });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Shared state of the ServiceLB controller
pub struct ServiceLbContext {
    /// Cluster access
    pub kube: Arc<dyn ServiceLbKube>,
    /// Current mesh config
    pub mesh_config: Arc<MeshConfigStore>,
}

/// Name of the DaemonSet serving `service`
pub fn daemon_set_name(service: &str) -> String {
    format!("svclb-{service}")
}

/// True when `service` is a LoadBalancer this controller should serve
pub fn is_handled(service: &Service) -> bool {
    let Some(spec) = service.spec.as_ref() else {
        return false;
    };
    spec.type_.as_deref() == Some("LoadBalancer")
        && spec
            .load_balancer_class
            .as_deref()
            .map_or(true, |class| class == SERVICE_LB_CLASS)
}

/// DaemonSet exposing every port of `service` on each node
pub fn build_daemon_set(service: &Service, config: &MeshConfig) -> DaemonSet {
    let name = service.name_any();
    let ds_name = daemon_set_name(&name);
    let spec = service.spec.clone().unwrap_or_default();
    let cluster_ip = spec.cluster_ip.clone().unwrap_or_default();
    let labels = BTreeMap::from([
        ("app".to_string(), ds_name.clone()),
        (SERVICE_LB_LABEL.to_string(), name.clone()),
        (PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string()),
    ]);

    let containers = spec
        .ports
        .unwrap_or_default()
        .iter()
        .map(|port| {
            let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
            let env = |key: &str, value: String| EnvVar {
                name: key.to_string(),
                value: Some(value),
                value_from: None,
            };
            Container {
                name: format!("lb-{}-{}", protocol.to_lowercase(), port.port),
                image: Some(config.service_lb_image()),
                ports: Some(vec![ContainerPort {
                    name: port.name.clone(),
                    container_port: port.port,
                    host_port: Some(port.port),
                    protocol: Some(protocol.clone()),
                    ..Default::default()
                }]),
                env: Some(vec![
                    env("SRC_PORT", port.port.to_string()),
                    env("DEST_PROTO", protocol.clone()),
                    env("DEST_PORT", port.port.to_string()),
                    env("DEST_IPS", cluster_ip.clone()),
                ]),
                security_context: Some(SecurityContext {
                    capabilities: Some(Capabilities {
                        add: Some(vec!["NET_ADMIN".to_string()]),
                        drop: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect();

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(ds_name),
            namespace: service.namespace(),
            labels: Some(labels.clone()),
            owner_references: service.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    automount_service_account_token: Some(false),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn is_ready<'a>(conditions: impl IntoIterator<Item = (&'a str, &'a str)>) -> bool {
    conditions
        .into_iter()
        .any(|(type_, status)| type_ == "Ready" && status == "True")
}

fn pod_ready(pod: &Pod) -> bool {
    let conditions = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .map(|c| (c.type_.as_str(), c.status.as_str()));
    is_ready(conditions)
}

fn node_ready(node: &Node) -> bool {
    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .map(|c| (c.type_.as_str(), c.status.as_str()));
    is_ready(conditions)
}

/// ExternalIP of `node`, else its InternalIP
fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    ["ExternalIP", "InternalIP"].iter().find_map(|kind| {
        addresses
            .iter()
            .find(|a| a.type_ == *kind)
            .map(|a| a.address.clone())
    })
}

/// Addresses of ready nodes running a ready load balancer pod, sorted
pub fn ingress_addresses(pods: &[Pod], nodes: &[Node]) -> Vec<String> {
    let hosts: BTreeSet<&str> = pods
        .iter()
        .filter(|p| pod_ready(p))
        .filter_map(|p| p.spec.as_ref()?.node_name.as_deref())
        .collect();
    nodes
        .iter()
        .filter(|n| hosts.contains(n.name_any().as_str()) && node_ready(n))
        .filter_map(node_address)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn current_addresses(service: &Service) -> Vec<String> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|i| i.ip.clone())
        .collect()
}

/// Reconcile one Service
#[instrument(skip(service, ctx), fields(service = %service.name_any()))]
pub async fn reconcile(service: Arc<Service>, ctx: Arc<ServiceLbContext>) -> Result<Action> {
    let config = ctx.mesh_config.require()?;
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_any();

    if !config.service_lb.enabled || !is_handled(&service) {
        if service.metadata.deletion_timestamp.is_none() && config.service_lb.enabled {
            ctx.kube
                .delete_daemon_set(&namespace, &daemon_set_name(&name))
                .await?;
        }
        return Ok(Action::await_change());
    }

    ctx.kube
        .apply_daemon_set(&build_daemon_set(&service, &config))
        .await?;

    let pods = ctx.kube.lb_pods(&namespace, &name).await?;
    let nodes = ctx.kube.nodes().await?;
    let addresses = ingress_addresses(&pods, &nodes);
    let mut current = current_addresses(&service);
    current.sort();
    if addresses != current {
        debug!(?addresses, "load balancer addresses changed");
        let ingress = addresses
            .iter()
            .map(|ip| LoadBalancerIngress {
                ip: Some(ip.clone()),
                ..Default::default()
            })
            .collect();
        ctx.kube.patch_ingress(&namespace, &name, ingress).await?;
        info!(%namespace, service = %name, count = addresses.len(), "load balancer ingress updated");
    }
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Requeue a failed reconcile
pub fn error_policy(service: Arc<Service>, error: &Error, _ctx: Arc<ServiceLbContext>) -> Action {
    error!(?error, service = %service.name_any(), "service load balancer reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}
