//! Service registry document
//!
//! `registry.json` maps every service port of the cluster to the addresses
//! proxies may dial: ready endpoints for ClusterIP services, the external
//! name for ExternalName services and peer gateways for imported services.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde::Serialize;
use tracing::warn;

use meshfleet_common::crd::ServiceImport;

/// Content of `registry.json`
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ServiceRegistry {
    /// `namespace/name[:port-name]` to `host:port` targets
    pub services: BTreeMap<String, Vec<String>>,
}

impl ServiceRegistry {
    fn add(&mut self, key: String, targets: Vec<String>) {
        if targets.is_empty() {
            return;
        }
        self.services.entry(key).or_default().extend(targets);
    }
}

/// Registry key of one service port
pub fn registry_key(namespace: &str, name: &str, port_name: Option<&str>) -> String {
    match port_name.filter(|p| !p.is_empty()) {
        Some(port) => format!("{namespace}/{name}:{port}"),
        None => format!("{namespace}/{name}"),
    }
}

/// Build the registry from the cluster's stores
pub fn build_registry<'a>(
    services: impl IntoIterator<Item = &'a Service>,
    endpoints: impl IntoIterator<Item = &'a Endpoints>,
    imports: impl IntoIterator<Item = &'a ServiceImport>,
) -> ServiceRegistry {
    let endpoints: BTreeMap<(String, String), &Endpoints> = endpoints
        .into_iter()
        .map(|ep| ((ep.namespace().unwrap_or_default(), ep.name_any()), ep))
        .collect();

    let mut registry = ServiceRegistry::default();

    for service in services {
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();
        let Some(spec) = service.spec.as_ref() else {
            continue;
        };
        let ports = spec.ports.as_deref().unwrap_or_default();

        match spec.type_.as_deref().unwrap_or("ClusterIP") {
            "ClusterIP" => {
                let Some(ep) = endpoints.get(&(namespace.clone(), name.clone())) else {
                    continue;
                };
                for port in ports {
                    registry.add(
                        registry_key(&namespace, &name, port.name.as_deref()),
                        ready_targets(ep, port),
                    );
                }
            }
            "ExternalName" => {
                let Some(external) = spec.external_name.as_deref() else {
                    continue;
                };
                if !is_usable_external_name(external) {
                    warn!(service = %format!("{namespace}/{name}"), external, "unusable external name");
                    continue;
                }
                for port in ports {
                    registry.add(
                        registry_key(&namespace, &name, port.name.as_deref()),
                        vec![format!("{external}:{}", target_port(port))],
                    );
                }
            }
            _ => {}
        }
    }

    for import in imports {
        let namespace = import.namespace().unwrap_or_default();
        let name = import.name_any();
        for port in &import.spec.ports {
            let targets = port
                .endpoints
                .iter()
                .flat_map(|e| e.targets.iter().cloned())
                .collect();
            registry.add(
                registry_key(&namespace, &name, port.name.as_deref()),
                targets,
            );
        }
    }

    registry
}

/// `ip:port` of every ready address serving `port`
pub(crate) fn ready_targets(endpoints: &Endpoints, port: &ServicePort) -> Vec<String> {
    let mut targets = Vec::new();
    for subset in endpoints.subsets.as_deref().unwrap_or_default() {
        let Some(ep_port) = subset
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|p| p.name.as_deref().unwrap_or_default() == port.name.as_deref().unwrap_or_default())
        else {
            continue;
        };
        for address in subset.addresses.as_deref().unwrap_or_default() {
            targets.push(format!("{}:{}", address.ip, ep_port.port));
        }
    }
    targets
}

fn target_port(port: &ServicePort) -> i32 {
    match &port.target_port {
        Some(IntOrString::Int(p)) => *p,
        _ => port.port,
    }
}

fn is_usable_external_name(name: &str) -> bool {
    if name.is_empty() || name == "localhost" {
        return false;
    }
    match name.parse::<IpAddr>() {
        Ok(ip) => !ip.is_loopback(),
        Err(_) => name
            .trim_end_matches('.')
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= 63),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};

    pub fn endpoints(namespace: &str, name: &str, ips: &[&str], ports: &[(&str, i32)]) -> Endpoints {
        let mut ep = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ports: Some(
                    ports
                        .iter()
                        .map(|(name, port)| EndpointPort {
                            name: Some(name.to_string()),
                            port: *port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
            ..Default::default()
        };
        ep.metadata.namespace = Some(namespace.to_string());
        ep.metadata.name = Some(name.to_string());
        ep
    }
}
