//! Ingress config document
//!
//! `ingress.json` is built from the Ingresses of the mesh ingress class. It
//! holds a router table keyed `host+path`, a balancer table keyed by service
//! port, TLS certificates by host and the trusted CAs of every upstream.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, Ingress, IngressClass, IngressServiceBackend,
};
use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, warn};

use meshfleet_common::crd::LoadBalancerType;
use meshfleet_common::MESH_INGRESS_CLASS;

use super::registry::registry_key;
use super::ClusterSnapshot;

/// Legacy ingress class annotation
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
/// Marks the default IngressClass
pub const DEFAULT_CLASS_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";

/// Per-ingress behaviour annotations
pub mod annotations {
    /// `from,to` rewrite pair
    pub const REWRITE_TARGET: &str = "meshfleet.io/rewrite-target";
    /// Sticky sessions, boolean
    pub const SESSION_STICKY: &str = "meshfleet.io/session-sticky";
    /// Balancer algorithm
    pub const LB_TYPE: &str = "meshfleet.io/lb-type";
    /// SNI sent to the upstream
    pub const UPSTREAM_SSL_NAME: &str = "meshfleet.io/upstream-ssl-name";
    /// `[namespace/]name` of the upstream client certificate Secret
    pub const UPSTREAM_SSL_SECRET: &str = "meshfleet.io/upstream-ssl-secret";
    /// Verify the upstream certificate, boolean
    pub const UPSTREAM_SSL_VERIFY: &str = "meshfleet.io/upstream-ssl-verify";
    /// `[namespace/]name` of a Secret whose `ca.crt` clients must chain to
    pub const TLS_TRUSTED_CA_SECRET: &str = "meshfleet.io/tls-trusted-ca-secret";
}

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";
const CA_CERT_KEY: &str = "ca.crt";

/// Content of `ingress.json`
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct IngressConfig {
    /// PEM CAs trusted by the ingress
    #[serde(rename = "trustedCAs")]
    pub trusted_cas: Vec<String>,
    /// Certificates by host
    pub certificates: BTreeMap<String, CertificateSpec>,
    /// Routes by `host+path`
    pub routes: BTreeMap<String, RouterSpec>,
    /// Balancers by service port
    pub services: BTreeMap<String, BalancerSpec>,
}

/// One router entry
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct RouterSpec {
    /// Balancer key
    pub service: String,
    /// `[from, to]`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rewrite: Vec<String>,
    /// Host is served over TLS
    #[serde(rename = "isTLS")]
    pub is_tls: bool,
}

/// One balancer entry
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct BalancerSpec {
    /// Sticky sessions
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub sticky: bool,
    /// Algorithm
    pub balancer: LoadBalancerType,
    /// Upstream endpoints and TLS settings
    pub upstream: UpstreamSpec,
}

/// Upstream of a balancer
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSpec {
    /// SNI
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ssl_name: String,
    /// Client certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<CertificateSpec>,
    /// Verify the upstream certificate
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ssl_verify: bool,
    /// Ready endpoints
    pub endpoints: Vec<UpstreamEndpoint>,
}

/// Certificate material from a TLS Secret
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct CertificateSpec {
    /// PEM certificate
    pub cert: String,
    /// PEM key
    pub key: String,
    /// PEM CA
    pub ca: String,
}

/// One upstream address
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct UpstreamEndpoint {
    /// Pod IP
    pub ip: String,
    /// Target port
    pub port: i32,
    /// Transport protocol
    pub protocol: String,
}

/// True when the default IngressClass of the cluster is the mesh class
pub fn mesh_class_is_default(classes: &[&IngressClass]) -> bool {
    classes.iter().any(|class| {
        class.name_any() == MESH_INGRESS_CLASS
            && class
                .annotations()
                .get(DEFAULT_CLASS_ANNOTATION)
                .is_some_and(|v| v == "true")
    })
}

/// True when `ingress` is served by the mesh ingress controller
pub fn is_mesh_ingress(ingress: &Ingress, mesh_is_default: bool) -> bool {
    let class_name = ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref());
    let legacy = ingress
        .annotations()
        .get(INGRESS_CLASS_ANNOTATION)
        .map(String::as_str);
    match (class_name, legacy) {
        (Some(class), _) => class == MESH_INGRESS_CLASS,
        (None, Some(class)) => class == MESH_INGRESS_CLASS,
        (None, None) => mesh_is_default,
    }
}

/// Router path of an ingress path; `None` for ImplementationSpecific
pub fn route_path(path: &HTTPIngressPath) -> Option<String> {
    let value = path.path.as_deref().unwrap_or("/");
    match path.path_type.as_str() {
        "Exact" => Some(value.to_string()),
        "Prefix" if value.ends_with("/*") => Some(value.to_string()),
        "Prefix" if value.ends_with('/') => Some(format!("{value}*")),
        "Prefix" => Some(format!("{value}/*")),
        _ => None,
    }
}

fn parse_bool(ingress: &Ingress, key: &str) -> bool {
    let value = ingress
        .annotations()
        .get(key)
        .map(|v| v.to_lowercase())
        .unwrap_or_default();
    match value.as_str() {
        "yes" | "true" | "1" | "on" => true,
        "no" | "false" | "0" | "off" | "" => false,
        other => {
            warn!(ingress = %ingress.name_any(), annotation = key, value = other, "invalid boolean, using false");
            false
        }
    }
}

fn parse_balancer(ingress: &Ingress) -> LoadBalancerType {
    match ingress.annotations().get(annotations::LB_TYPE).map(String::as_str) {
        None | Some("") | Some("RoundRobinLoadBalancer") => LoadBalancerType::RoundRobinLoadBalancer,
        Some("HashingLoadBalancer") => LoadBalancerType::HashingLoadBalancer,
        Some("LeastWorkLoadBalancer") => LoadBalancerType::LeastWorkLoadBalancer,
        Some(other) => {
            warn!(ingress = %ingress.name_any(), value = other, "unsupported balancer, using round robin");
            LoadBalancerType::RoundRobinLoadBalancer
        }
    }
}

fn parse_rewrite(ingress: &Ingress) -> Vec<String> {
    let Some(value) = ingress.annotations().get(annotations::REWRITE_TARGET) else {
        return Vec::new();
    };
    match value.split_once(',') {
        Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
            vec![from.trim().to_string(), to.trim().to_string()]
        }
        _ => {
            warn!(ingress = %ingress.name_any(), value = %value, "rewrite-target must be a from,to pair");
            Vec::new()
        }
    }
}

struct Lookup<'a> {
    services: BTreeMap<(String, String), &'a Service>,
    endpoints: BTreeMap<(String, String), &'a Endpoints>,
    secrets: BTreeMap<(String, String), &'a Secret>,
    mesh_namespace: &'a str,
}

impl<'a> Lookup<'a> {
    fn new(snapshot: &'a ClusterSnapshot, mesh_namespace: &'a str) -> Self {
        fn index<K: ResourceExt>(items: &[std::sync::Arc<K>]) -> BTreeMap<(String, String), &K> {
            items
                .iter()
                .map(|i| ((i.namespace().unwrap_or_default(), i.name_any()), i.as_ref()))
                .collect()
        }
        Self {
            services: index(&snapshot.services),
            endpoints: index(&snapshot.endpoints),
            secrets: index(&snapshot.secrets),
            mesh_namespace,
        }
    }

    fn certificate(&self, namespace: &str, name: &str) -> Option<CertificateSpec> {
        let Some(secret) = self.secrets.get(&(namespace.to_string(), name.to_string())) else {
            warn!(secret = %format!("{namespace}/{name}"), "certificate secret not found");
            return None;
        };
        let field = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .unwrap_or_default()
        };
        Some(CertificateSpec {
            cert: field(TLS_CERT_KEY),
            key: field(TLS_KEY_KEY),
            ca: field(CA_CERT_KEY),
        })
    }

    /// `[namespace/]name` reference, defaulting to the mesh namespace
    fn secret_ref(&self, ingress: &Ingress, value: &str) -> Option<CertificateSpec> {
        match value.split('/').collect::<Vec<_>>().as_slice() {
            [name] => self.certificate(self.mesh_namespace, name),
            [namespace, name] => self.certificate(namespace, name),
            _ => {
                warn!(ingress = %ingress.name_any(), value, "invalid secret reference");
                None
            }
        }
    }

    /// Registry key and upstream endpoints of a backend
    fn backend(
        &self,
        namespace: &str,
        backend: &IngressServiceBackend,
    ) -> Option<(String, Vec<UpstreamEndpoint>)> {
        let service = self
            .services
            .get(&(namespace.to_string(), backend.name.clone()))?;
        let port = backend.port.as_ref()?;
        let service_port = service
            .spec
            .as_ref()?
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|p| match (&port.name, port.number) {
                (Some(name), _) if !name.is_empty() => p.name.as_deref() == Some(name.as_str()),
                (_, Some(number)) => p.port == number,
                _ => false,
            })?;

        let key = registry_key(namespace, &backend.name, service_port.name.as_deref());
        let protocol = service_port
            .protocol
            .clone()
            .unwrap_or_else(|| "TCP".to_string());
        let endpoints = self
            .endpoints
            .get(&(namespace.to_string(), backend.name.clone()))
            .map(|ep| super::registry::ready_targets(ep, service_port))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|target| {
                let (ip, port) = target.rsplit_once(':')?;
                Some(UpstreamEndpoint {
                    ip: ip.to_string(),
                    port: port.parse().ok()?,
                    protocol: protocol.clone(),
                })
            })
            .collect();
        Some((key, endpoints))
    }
}

/// Build the ingress config of every mesh-class Ingress in `snapshot`
pub fn build_ingress_config(snapshot: &ClusterSnapshot, mesh_namespace: &str) -> IngressConfig {
    let lookup = Lookup::new(snapshot, mesh_namespace);
    let classes: Vec<&IngressClass> = snapshot.ingress_classes.iter().map(|c| c.as_ref()).collect();
    let mesh_is_default = mesh_class_is_default(&classes);

    let mut config = IngressConfig::default();
    let mut trusted: BTreeSet<String> = BTreeSet::new();

    let mut ingresses: Vec<&Ingress> = snapshot
        .ingresses
        .iter()
        .map(|i| i.as_ref())
        .filter(|i| is_mesh_ingress(i, mesh_is_default))
        .collect();
    ingresses.sort_by_key(|i| (i.namespace(), i.name_any()));

    for ingress in ingresses {
        let namespace = ingress.namespace().unwrap_or_default();
        let Some(spec) = ingress.spec.as_ref() else {
            continue;
        };

        let tls = spec.tls.as_deref().unwrap_or_default();
        let tls_certificate = |host: &str| {
            tls.iter()
                .find(|t| t.hosts.as_deref().unwrap_or_default().iter().any(|h| h == host))
        };

        let sticky = parse_bool(ingress, annotations::SESSION_STICKY);
        let balancer = parse_balancer(ingress);
        let rewrite = parse_rewrite(ingress);
        let ssl_name = ingress
            .annotations()
            .get(annotations::UPSTREAM_SSL_NAME)
            .cloned()
            .unwrap_or_default();
        let ssl_cert = ingress
            .annotations()
            .get(annotations::UPSTREAM_SSL_SECRET)
            .filter(|v| !v.is_empty())
            .and_then(|v| lookup.secret_ref(ingress, v));
        let ssl_verify = parse_bool(ingress, annotations::UPSTREAM_SSL_VERIFY);
        if let Some(ca) = ingress
            .annotations()
            .get(annotations::TLS_TRUSTED_CA_SECRET)
            .filter(|v| !v.is_empty())
            .and_then(|v| lookup.secret_ref(ingress, v))
            .map(|c| c.ca)
            .filter(|ca| !ca.is_empty())
        {
            trusted.insert(ca);
        }

        let mut seen_backends = BTreeSet::new();
        for rule in spec.rules.as_deref().unwrap_or_default() {
            let host = rule.host.clone().unwrap_or_default();
            let Some(http) = rule.http.as_ref() else {
                continue;
            };
            let tls_entry = tls_certificate(&host);

            for path in &http.paths {
                let Some(backend) = path.backend.service.as_ref() else {
                    continue;
                };
                let Some(route) = route_path(path) else {
                    continue;
                };
                let Some((service_key, endpoints)) = lookup.backend(&namespace, backend) else {
                    debug!(ingress = %ingress.name_any(), service = %backend.name, "backend service port not found");
                    continue;
                };
                // First rule for a service port wins within one Ingress
                if !seen_backends.insert(service_key.clone()) {
                    continue;
                }
                if endpoints.is_empty() {
                    continue;
                }

                config.routes.insert(
                    format!("{host}{route}"),
                    RouterSpec {
                        service: service_key.clone(),
                        rewrite: rewrite.clone(),
                        is_tls: tls_entry.is_some(),
                    },
                );
                config.services.insert(
                    service_key,
                    BalancerSpec {
                        sticky,
                        balancer,
                        upstream: UpstreamSpec {
                            ssl_name: ssl_name.clone(),
                            ssl_cert: ssl_cert.clone(),
                            ssl_verify,
                            endpoints,
                        },
                    },
                );

                if let Some(secret_name) = tls_entry.and_then(|t| t.secret_name.as_deref()) {
                    if !host.is_empty() && !config.certificates.contains_key(&host) {
                        if let Some(cert) = lookup.certificate(&namespace, secret_name) {
                            if !cert.ca.is_empty() {
                                trusted.insert(cert.ca.clone());
                            }
                            config.certificates.insert(host.clone(), cert);
                        }
                    }
                }
            }
        }
    }

    config.trusted_cas = trusted.into_iter().collect();
    config
}
