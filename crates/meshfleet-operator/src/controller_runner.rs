//! Controller runner - builds controller futures for each reconciler
//!
//! Each `build_*` function returns a Vec of boxed futures that the binary
//! joins. Construction does no I/O, so the set of controllers a manager runs
//! is decided entirely by the mesh config it starts with.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::DynamicObject;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use meshfleet_common::crd::{Cluster, NamespacedIngress, ProxyProfile};
use meshfleet_common::kube_utils::HasApiResource;
use meshfleet_common::{PART_OF_LABEL, PROXY_PROFILE_LABEL};
use meshfleet_connector::supervisor::{
    error_policy as cluster_error_policy, reconcile as cluster_reconcile,
};
use meshfleet_connector::{Supervisor, WATCH_TIMEOUT_SECS};

use crate::gateway::{self, Gateway, GatewayContext, HttpRoute};
use crate::namespaced_ingress::{self, NsigContext};
use crate::proxy_profile::{self, ProfileContext};
use crate::service_lb::{self, ServiceLbContext, SERVICE_LB_LABEL};

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the Cluster controller plus the supervisor's deletion watch and
/// federation loop
pub fn build_supervisor_controllers(
    client: Client,
    supervisor: Arc<Supervisor>,
    cancel: CancellationToken,
) -> Vec<ControllerFuture> {
    let clusters: Api<Cluster> = Api::all(client.clone());

    tracing::info!("- Cluster controller");
    let controller = Controller::new(clusters, watcher_config())
        .shutdown_on_signal()
        .run(cluster_reconcile, cluster_error_policy, supervisor.clone())
        .for_each(log_reconcile_result("Cluster"));

    vec![
        Box::pin(controller),
        Box::pin(supervisor.clone().watch_deletions(client, cancel.clone())),
        Box::pin(supervisor.run_federation(cancel)),
    ]
}

/// Build the ProxyProfile controller
pub fn build_proxy_profile_controllers(
    client: Client,
    ctx: Arc<ProfileContext>,
) -> Vec<ControllerFuture> {
    let profiles: Api<ProxyProfile> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::all(client);

    tracing::info!("- ProxyProfile controller");
    vec![Box::pin(
        Controller::new(profiles, watcher_config())
            .owns(config_maps, watcher_config().labels(PROXY_PROFILE_LABEL))
            .shutdown_on_signal()
            .run(proxy_profile::reconcile, proxy_profile::error_policy, ctx)
            .for_each(log_reconcile_result("ProxyProfile")),
    )]
}

/// Build the NamespacedIngress controller
pub fn build_namespaced_ingress_controllers(
    client: Client,
    ctx: Arc<NsigContext>,
) -> Vec<ControllerFuture> {
    let ingresses: Api<NamespacedIngress> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client);

    tracing::info!("- NamespacedIngress controller");
    vec![Box::pin(
        Controller::new(ingresses, watcher_config())
            .owns(deployments, watcher_config().labels(PART_OF_LABEL))
            .shutdown_on_signal()
            .run(
                namespaced_ingress::reconcile,
                namespaced_ingress::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("NamespacedIngress")),
    )]
}

/// Build the LoadBalancer Service controller
pub fn build_service_lb_controllers(
    client: Client,
    ctx: Arc<ServiceLbContext>,
) -> Vec<ControllerFuture> {
    let services: Api<Service> = Api::all(client.clone());
    let daemon_sets: Api<DaemonSet> = Api::all(client);

    tracing::info!("- ServiceLB controller");
    vec![Box::pin(
        Controller::new(services, watcher_config())
            .owns(daemon_sets, watcher_config().labels(SERVICE_LB_LABEL))
            .shutdown_on_signal()
            .run(service_lb::reconcile, service_lb::error_policy, ctx)
            .for_each(log_reconcile_result("ServiceLB")),
    )]
}

/// Build the Gateway and HTTPRoute controllers; both rebuild the same
/// routing document
pub fn build_gateway_controllers(
    client: Client,
    ctx: Arc<GatewayContext>,
) -> Vec<ControllerFuture> {
    let gateway_ar = Gateway::api_resource();
    let route_ar = HttpRoute::api_resource();
    let gateways: Api<DynamicObject> = Api::all_with(client.clone(), &gateway_ar);
    let routes: Api<DynamicObject> = Api::all_with(client, &route_ar);

    tracing::info!("- Gateway API controllers");
    let gateway_ctrl = Controller::new_with(gateways, watcher_config(), gateway_ar)
        .shutdown_on_signal()
        .run(gateway::reconcile, gateway::error_policy, ctx.clone())
        .for_each(log_reconcile_result("Gateway"));
    let route_ctrl = Controller::new_with(routes, watcher_config(), route_ar)
        .shutdown_on_signal()
        .run(gateway::reconcile, gateway::error_policy, ctx)
        .for_each(log_reconcile_result("HTTPRoute"));

    vec![Box::pin(gateway_ctrl), Box::pin(route_ctrl)]
}

/// Create a closure that logs reconciliation results.
pub fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
