//! Gateway API support
//!
//! Gateways and HTTPRoutes of the whole cluster are rendered into one
//! routing document, `config/main.json` of the cluster's gateways codebase.
//! Listeners are keyed `<namespace>/<gateway>/<listener>` and each route
//! rule becomes one entry under every listener it attaches to, with its
//! backends resolved to endpoint addresses. The document is only pushed
//! into an existing codebase, and only when its hash changes or the
//! codebase lost it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject, ListParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::kube_utils::{ignore_not_found, HasApiResource};
use meshfleet_common::{Error, Result};
use meshfleet_config::MeshConfigStore;
use meshfleet_connector::local::DocumentPusher;
use meshfleet_repo::documents::MAIN_JSON;
use meshfleet_repo::RepoClient;

const RESYNC_INTERVAL: Duration = Duration::from_secs(60);
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

// =============================================================================
// Gateway API types
// =============================================================================

/// Gateway API Gateway, reduced to the fields routing needs
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Gateway specification
    #[serde(default)]
    pub spec: GatewaySpec,
}

impl HasApiResource for Gateway {
    const API_VERSION: &'static str = "gateway.networking.k8s.io/v1";
    const KIND: &'static str = "Gateway";
}

/// Gateway spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// GatewayClass name
    #[serde(default)]
    pub gateway_class_name: String,
    /// Listeners
    #[serde(default)]
    pub listeners: Vec<GatewayListener>,
}

/// Gateway listener
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayListener {
    /// Listener name
    pub name: String,
    /// Optional hostname filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Port number
    pub port: i32,
    /// Protocol (HTTP, HTTPS, TCP, ...)
    pub protocol: String,
}

/// Gateway API HTTPRoute, reduced to the fields routing needs
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Route specification
    #[serde(default)]
    pub spec: HttpRouteSpec,
}

impl HasApiResource for HttpRoute {
    const API_VERSION: &'static str = "gateway.networking.k8s.io/v1";
    const KIND: &'static str = "HTTPRoute";
}

/// HTTPRoute spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    /// Gateways the route attaches to
    #[serde(default)]
    pub parent_refs: Vec<ParentRef>,
    /// Hostnames matched by the route
    #[serde(default)]
    pub hostnames: Vec<String>,
    /// Routing rules
    #[serde(default)]
    pub rules: Vec<HttpRouteRule>,
}

/// Reference from a route to a Gateway
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    /// Gateway name
    pub name: String,
    /// Gateway namespace; defaults to the route's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Listener name; all listeners when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    /// Listener port; all ports when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// One HTTPRoute rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteRule {
    /// Request matches; a single `/` prefix when empty
    #[serde(default)]
    pub matches: Vec<HttpRouteMatch>,
    /// Backends receiving matched requests
    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,
}

/// Request match of a rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteMatch {
    /// Path match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathMatch>,
}

/// Path part of a match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PathMatch {
    /// Match type (PathPrefix, Exact)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Path value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Service backend of a rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    /// Service name
    pub name: String,
    /// Service namespace; defaults to the route's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Service port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Relative weight, 1 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

// =============================================================================
// Routing document
// =============================================================================

/// Document read by the gateways proxy script
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayDocument {
    /// Ports to listen on
    pub listeners: Vec<ListenerDoc>,
    /// Route entries by listener key
    pub routes: BTreeMap<String, Vec<RouteDoc>>,
}

/// Listener of the document
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ListenerDoc {
    /// `<namespace>/<gateway>/<listener>`
    pub name: String,
    /// Port
    pub port: i32,
}

/// One route rule bound to a listener
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteDoc {
    /// Route of origin, `<namespace>/<name>`
    pub route: String,
    /// Hostnames; empty matches any host
    pub hostnames: Vec<String>,
    /// Path matches
    pub matches: Vec<MatchDoc>,
    /// Resolved backends
    pub backends: Vec<BackendDoc>,
}

/// Path match of a route entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchDoc {
    /// Path prefix or exact path
    pub path: String,
    /// True for exact matching
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exact: bool,
}

/// Backend of a route entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BackendDoc {
    /// `<namespace>/<service>:<port>`
    pub service: String,
    /// Relative weight
    pub weight: i32,
    /// `ip:port` addresses
    pub endpoints: Vec<String>,
}

/// Endpoint addresses of one Service port, sorted
pub fn resolve_endpoints(service: &Service, endpoints: &Endpoints, port: i32) -> Vec<String> {
    let service_port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == port));
    let Some(service_port) = service_port else {
        return Vec::new();
    };

    let mut out = BTreeSet::new();
    for subset in endpoints.subsets.iter().flatten() {
        let ports = subset.ports.as_deref().unwrap_or_default();
        let target = match &service_port.name {
            Some(name) => ports.iter().find(|p| p.name.as_ref() == Some(name)),
            None => ports.first(),
        };
        let Some(target) = target else { continue };
        for address in subset.addresses.iter().flatten() {
            out.insert(format!("{}:{}", address.ip, target.port));
        }
    }
    out.into_iter().collect()
}

fn routable(listener: &GatewayListener) -> bool {
    matches!(listener.protocol.as_str(), "HTTP" | "HTTPS")
}

fn attaches(parent: &ParentRef, listener: &GatewayListener) -> bool {
    parent
        .section_name
        .as_ref()
        .map_or(true, |section| section == &listener.name)
        && parent.port.map_or(true, |port| port == listener.port)
}

fn rule_matches(rule: &HttpRouteRule) -> Vec<MatchDoc> {
    let matches: Vec<MatchDoc> = rule
        .matches
        .iter()
        .map(|m| {
            let path = m.path.clone().unwrap_or_default();
            MatchDoc {
                path: path.value.unwrap_or_else(|| "/".to_string()),
                exact: path.type_.as_deref() == Some("Exact"),
            }
        })
        .collect();
    if matches.is_empty() {
        vec![MatchDoc {
            path: "/".to_string(),
            exact: false,
        }]
    } else {
        matches
    }
}

/// Build the routing document.
///
/// `resolve(namespace, service, port)` returns endpoint addresses of a
/// backend. Listeners of different Gateways sharing a port keep only the
/// first in namespace/name order.
pub fn build_document<F>(gateways: &[Gateway], routes: &[HttpRoute], resolve: F) -> GatewayDocument
where
    F: Fn(&str, &str, i32) -> Vec<String>,
{
    let mut doc = GatewayDocument::default();
    let mut gateways: Vec<&Gateway> = gateways.iter().collect();
    gateways.sort_by_key(|g| (g.metadata.namespace.clone(), g.metadata.name.clone()));

    let mut ports = BTreeSet::new();
    // (namespace, gateway) -> listeners kept for it
    let mut kept: BTreeMap<(String, String), Vec<(&GatewayListener, String)>> = BTreeMap::new();
    for gateway in &gateways {
        let namespace = gateway.metadata.namespace.clone().unwrap_or_default();
        let name = gateway.metadata.name.clone().unwrap_or_default();
        for listener in gateway.spec.listeners.iter().filter(|l| routable(l)) {
            if !ports.insert(listener.port) {
                debug!(%namespace, gateway = %name, port = listener.port, "port already taken, listener skipped");
                continue;
            }
            let key = format!("{namespace}/{name}/{}", listener.name);
            doc.listeners.push(ListenerDoc {
                name: key.clone(),
                port: listener.port,
            });
            kept.entry((namespace.clone(), name.clone()))
                .or_default()
                .push((listener, key));
        }
    }

    let mut routes: Vec<&HttpRoute> = routes.iter().collect();
    routes.sort_by_key(|r| (r.metadata.namespace.clone(), r.metadata.name.clone()));
    for route in routes {
        let namespace = route.metadata.namespace.clone().unwrap_or_default();
        let route_name = format!("{namespace}/{}", route.metadata.name.clone().unwrap_or_default());
        let entries: Vec<RouteDoc> = route
            .spec
            .rules
            .iter()
            .map(|rule| RouteDoc {
                route: route_name.clone(),
                hostnames: route.spec.hostnames.clone(),
                matches: rule_matches(rule),
                backends: rule
                    .backend_refs
                    .iter()
                    .filter_map(|backend| {
                        let port = backend.port?;
                        let ns = backend.namespace.clone().unwrap_or_else(|| namespace.clone());
                        Some(BackendDoc {
                            service: format!("{ns}/{}:{port}", backend.name),
                            weight: backend.weight.unwrap_or(1),
                            endpoints: resolve(&ns, &backend.name, port),
                        })
                    })
                    .filter(|b| b.weight > 0)
                    .collect(),
            })
            .collect();

        for parent in &route.spec.parent_refs {
            let parent_ns = parent.namespace.clone().unwrap_or_else(|| namespace.clone());
            let Some(listeners) = kept.get(&(parent_ns, parent.name.clone())) else {
                continue;
            };
            for (listener, key) in listeners {
                if attaches(parent, listener) {
                    doc.routes
                        .entry(key.clone())
                        .or_default()
                        .extend(entries.iter().cloned());
                }
            }
        }
    }
    doc
}

// =============================================================================
// Reconciler
// =============================================================================

/// Cluster access of the gateway reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayKube: Send + Sync {
    /// Every Gateway
    async fn gateways(&self) -> Result<Vec<Gateway>>;
    /// Every HTTPRoute
    async fn http_routes(&self) -> Result<Vec<HttpRoute>>;
    /// A Service
    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    /// Endpoints of a Service
    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;
}

/// [`GatewayKube`] over the API server
pub struct KubeGatewayApi {
    client: Client,
}

impl KubeGatewayApi {
    /// Talks to the cluster through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list<T: HasApiResource + for<'de> Deserialize<'de>>(&self) -> Result<Vec<T>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &T::api_resource());
        api.list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .map(|obj| Ok(serde_json::from_value(serde_json::to_value(obj)?)?))
            .collect()
    }
}

#[async_trait]
impl GatewayKube for KubeGatewayApi {
    async fn gateways(&self) -> Result<Vec<Gateway>> {
        self.list().await
    }

    async fn http_routes(&self) -> Result<Vec<HttpRoute>> {
        self.list().await
    }

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.get(name).await)
    }

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.get(name).await)
    }
}

/// Shared state of the gateway controllers
pub struct GatewayContext {
    /// Cluster access
    pub kube: Arc<dyn GatewayKube>,
    /// Current mesh config
    pub mesh_config: Arc<MeshConfigStore>,
    /// Hash-gated writer of the document; also serializes syncs
    pusher: Mutex<DocumentPusher>,
}

impl GatewayContext {
    /// Context that has pushed nothing yet
    pub fn new(
        kube: Arc<dyn GatewayKube>,
        repo: Arc<dyn RepoClient>,
        mesh_config: Arc<MeshConfigStore>,
    ) -> Self {
        Self {
            kube,
            pusher: Mutex::new(DocumentPusher::new(repo)),
            mesh_config,
        }
    }
}

/// Rebuild the routing document and push it when it changed.
///
/// Returns true when the repo was written.
pub async fn sync(ctx: &GatewayContext) -> Result<bool> {
    let config = ctx.mesh_config.require()?;
    if !config.gateway_api.enabled {
        return Ok(false);
    }
    let mut pusher = ctx.pusher.lock().await;

    let gateways = ctx.kube.gateways().await?;
    let routes = ctx.kube.http_routes().await?;

    let mut backends = BTreeSet::new();
    for route in &routes {
        let ns = route.metadata.namespace.clone().unwrap_or_default();
        for backend in route.spec.rules.iter().flat_map(|r| &r.backend_refs) {
            let backend_ns = backend.namespace.clone().unwrap_or_else(|| ns.clone());
            backends.insert((backend_ns, backend.name.clone()));
        }
    }
    let mut resolved: BTreeMap<(String, String), (Service, Endpoints)> = BTreeMap::new();
    for (ns, name) in backends {
        let service = ctx.kube.service(&ns, &name).await?;
        let endpoints = ctx.kube.endpoints(&ns, &name).await?;
        if let (Some(service), Some(endpoints)) = (service, endpoints) {
            resolved.insert((ns, name), (service, endpoints));
        }
    }

    let doc = build_document(&gateways, &routes, |ns, name, port| {
        resolved
            .get(&(ns.to_string(), name.to_string()))
            .map(|(svc, eps)| resolve_endpoints(svc, eps, port))
            .unwrap_or_default()
    });
    // A missing codebase is left to bootstrap so it keeps its base
    let basepath = config.gateways_codebase_path();
    let pushed = pusher.push(&basepath, MAIN_JSON, &doc).await?;
    if pushed {
        info!(codebase = %basepath, listeners = doc.listeners.len(), "gateway routes pushed");
    }
    Ok(pushed)
}

/// Reconcile on any Gateway or HTTPRoute change
#[instrument(skip(object, ctx), fields(name = %object.name_any()))]
pub async fn reconcile(object: Arc<DynamicObject>, ctx: Arc<GatewayContext>) -> Result<Action> {
    if !ctx.mesh_config.require()?.gateway_api.enabled {
        return Ok(Action::await_change());
    }
    sync(&ctx).await?;
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Requeue a failed reconcile
pub fn error_policy(object: Arc<DynamicObject>, error: &Error, _ctx: Arc<GatewayContext>) -> Action {
    error!(?error, name = %object.name_any(), "gateway route sync failed");
    Action::requeue(ERROR_REQUEUE)
}
