//! Per-cluster Object Store operations used by federation
//!
//! [`FleetApi`] is the only way connectors touch exports, imports and
//! services, so the federation rules below are testable against a mock.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Service, ServicePort as KubeServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::crd::{
    condition_types, set_condition, Condition, ConditionStatus, Endpoint, ServiceExport,
    ServiceImport, ServiceImportSpec, ServicePort,
};
use meshfleet_common::kube_utils::ignore_not_found;
use meshfleet_common::{Error, Result, FIELD_MANAGER};

use crate::bus::Geo;

/// Service type assumed when a Service omits it
const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";

/// Object Store operations of one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Service `namespace/name`, if present
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// ServiceExport `namespace/name`, if present
    async fn get_service_export(&self, namespace: &str, name: &str)
        -> Result<Option<ServiceExport>>;

    /// ServiceImport `namespace/name`, if present
    async fn get_service_import(&self, namespace: &str, name: &str)
        -> Result<Option<ServiceImport>>;

    /// Create or replace a ServiceImport
    async fn apply_service_import(&self, import: &ServiceImport) -> Result<()>;

    /// Delete ServiceImport `namespace/name`; absent is fine
    async fn delete_service_import(&self, namespace: &str, name: &str) -> Result<()>;

    /// Replace the status conditions of ServiceExport `namespace/name`
    async fn patch_export_conditions(
        &self,
        namespace: &str,
        name: &str,
        conditions: Vec<Condition>,
    ) -> Result<()>;

    /// Create `namespace` when missing
    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;
}

/// [`FleetApi`] backed by a cluster's API server
pub struct KubeFleetApi {
    client: Client,
}

impl KubeFleetApi {
    /// Operate on the cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FleetApi for KubeFleetApi {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.get(name).await)
    }

    async fn get_service_export(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceExport>> {
        let api: Api<ServiceExport> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.get(name).await)
    }

    async fn get_service_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceImport>> {
        let api: Api<ServiceImport> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.get(name).await)
    }

    async fn apply_service_import(&self, import: &ServiceImport) -> Result<()> {
        let namespace = import
            .namespace()
            .ok_or_else(|| Error::validation_for("ServiceImport", "namespace is required"))?;
        let api: Api<ServiceImport> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &import.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(import),
        )
        .await?;
        Ok(())
    }

    async fn delete_service_import(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ServiceImport> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn patch_export_conditions(
        &self,
        namespace: &str,
        name: &str,
        conditions: Vec<Condition>,
    ) -> Result<()> {
        let api: Api<ServiceExport> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": { "conditions": conditions } });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if ignore_not_found(api.get_metadata(namespace).await)?.is_some() {
            return Ok(());
        }
        let mut ns = Namespace::default();
        ns.metadata.name = Some(namespace.to_string());
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn service_type(service: &Service) -> &str {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or(DEFAULT_SERVICE_TYPE)
}

fn port_protocols(service: &Service) -> BTreeMap<i32, String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| (p.port, p.protocol.clone().unwrap_or_else(|| "TCP".to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Ports ordered by number, with the server's defaults filled in and the
/// per-cluster `nodePort` cleared
fn normalized_ports(service: &Service) -> Vec<KubeServicePort> {
    let mut ports: Vec<KubeServicePort> = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|mut p| {
            p.node_port = None;
            p.protocol.get_or_insert_with(|| "TCP".to_string());
            p.target_port.get_or_insert(IntOrString::Int(p.port));
            p
        })
        .collect();
    ports.sort_by_key(|p| p.port);
    ports
}

/// True for Services that cannot be exported
pub fn is_external_name(service: &Service) -> bool {
    service_type(service) == "ExternalName"
}

/// Compare an exported Service with the same-named Service of a peer.
///
/// Types must match and the ports must be identical: same numbers, names,
/// protocols, target ports and app protocols. Node ports are assigned per
/// cluster and are ignored.
pub fn check_compatible(exported: &Service, peer: &Service) -> Result<()> {
    let (a, b) = (service_type(exported), service_type(peer));
    if a != b {
        return Err(Error::validation_for(
            "ServiceExport",
            format!("service type doesn't match: {a} vs {b}"),
        ));
    }

    let exported_ports = port_protocols(exported);
    let peer_ports = port_protocols(peer);
    for (port, protocol) in &exported_ports {
        if let Some(other) = peer_ports.get(port) {
            if other != protocol {
                return Err(Error::validation_for(
                    "ServiceExport",
                    format!("service type doesn't match: {protocol} vs {other}"),
                ));
            }
        }
    }

    let a: BTreeSet<&i32> = exported_ports.keys().collect();
    let b: BTreeSet<&i32> = peer_ports.keys().collect();
    if a != b || normalized_ports(exported) != normalized_ports(peer) {
        return Err(Error::validation_for(
            "ServiceExport",
            "spec.ports conflict, please check service spec",
        ));
    }
    Ok(())
}

/// Run the conflict check of `export` against the cluster behind `fleet`
pub async fn validate_against(
    fleet: &dyn FleetApi,
    export: &ServiceExport,
    service: &Service,
) -> Result<()> {
    let namespace = export.namespace().unwrap_or_default();
    let name = export.name_any();
    let Some(peer) = fleet.get_service(&namespace, &name).await? else {
        return Ok(());
    };

    let federated = fleet.get_service_export(&namespace, &name).await?.is_some()
        || fleet.get_service_import(&namespace, &name).await?.is_some();
    if !federated {
        return Err(Error::validation_for(
            "ServiceExport",
            format!(
                "ambiguous export {namespace}/{name}: a same-named Service exists in a peer that neither exports nor imports it"
            ),
        ));
    }

    check_compatible(service, &peer)
}

/// Import spec contributed by `geo`'s export of `service`
///
/// One port per rule that names a port of the Service; each carries a single
/// endpoint for the exporting cluster pointing at its gateway.
pub fn import_spec(export: &ServiceExport, service: &Service, geo: &Geo) -> ServiceImportSpec {
    let gateway = geo.gateway.as_deref().unwrap_or_default();
    let cluster_key = geo.cluster_key.to_string();
    let service_ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let ports = export
        .spec
        .rules
        .iter()
        .filter_map(|rule| {
            let port = service_ports.iter().find(|p| p.port == rule.port_number)?;
            Some(ServicePort {
                name: port.name.clone(),
                port: port.port,
                protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                app_protocol: port.app_protocol.clone(),
                endpoints: vec![Endpoint {
                    cluster_key: cluster_key.clone(),
                    targets: vec![format!("{gateway}{}", rule.path)],
                }],
            })
        })
        .collect();

    ServiceImportSpec {
        type_: service_type(service).to_string(),
        ports,
        session_sticky: export.spec.session_sticky,
        load_balancer: export.spec.load_balancer,
    }
}

/// Merge `geo`'s endpoints for `export` into the import of the cluster
/// behind `fleet`, keeping every other cluster's endpoints
pub async fn upsert_import(
    fleet: &dyn FleetApi,
    export: &ServiceExport,
    service: &Service,
    geo: &Geo,
) -> Result<()> {
    let namespace = export.namespace().unwrap_or_default();
    let name = export.name_any();
    let incoming = import_spec(export, service, geo);
    if incoming.ports.is_empty() {
        debug!(export = %export.key(), "no exported rule matches a service port");
        return Ok(());
    }

    let mut spec = fleet
        .get_service_import(&namespace, &name)
        .await?
        .map(|existing| existing.spec)
        .unwrap_or_default();
    spec.merge_cluster(&geo.cluster_key.to_string(), &incoming);

    fleet.ensure_namespace(&namespace).await?;
    let mut import = ServiceImport::new(&name, spec);
    import.metadata.namespace = Some(namespace);
    fleet.apply_service_import(&import).await?;
    info!(import = %export.key(), cluster = %geo.cluster_key, "service import updated");
    Ok(())
}

/// Drop `geo`'s endpoints from the import of `export`, deleting the import
/// when nothing is left
pub async fn remove_import_endpoints(
    fleet: &dyn FleetApi,
    export: &ServiceExport,
    geo: &Geo,
) -> Result<()> {
    let namespace = export.namespace().unwrap_or_default();
    let name = export.name_any();
    let Some(existing) = fleet.get_service_import(&namespace, &name).await? else {
        debug!(import = %export.key(), "service import already gone");
        return Ok(());
    };

    let mut spec = existing.spec;
    if spec.remove_cluster(&geo.cluster_key.to_string()) {
        fleet.delete_service_import(&namespace, &name).await?;
        info!(import = %export.key(), "service import deleted");
        return Ok(());
    }

    let mut import = ServiceImport::new(&name, spec);
    import.metadata.namespace = Some(namespace);
    fleet.apply_service_import(&import).await
}

fn conditions_of(export: &ServiceExport) -> Vec<Condition> {
    export
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default()
}

async fn update_conditions(
    fleet: &dyn FleetApi,
    export: &ServiceExport,
    updates: Vec<Condition>,
) -> Result<()> {
    // Re-read so a stale bus copy does not clobber newer conditions
    let namespace = export.namespace().unwrap_or_default();
    let name = export.name_any();
    let current = fleet
        .get_service_export(&namespace, &name)
        .await?
        .ok_or_else(|| Error::not_found("ServiceExport", export.key()))?;

    let mut conditions = conditions_of(&current);
    for condition in updates {
        set_condition(&mut conditions, condition);
    }
    fleet
        .patch_export_conditions(&namespace, &name, conditions)
        .await
}

/// Mark `export` as conflicting with the fleet
pub async fn mark_conflict(fleet: &dyn FleetApi, export: &ServiceExport, error: &str) -> Result<()> {
    update_conditions(
        fleet,
        export,
        vec![Condition::new(
            condition_types::CONFLICT,
            ConditionStatus::True,
            "Conflict",
            format!("ServiceExport {} conflicts, {}", export.key(), error),
        )],
    )
    .await
}

/// Mark `export` as valid and conflict-free
pub async fn clear_conflict(fleet: &dyn FleetApi, export: &ServiceExport) -> Result<()> {
    update_conditions(
        fleet,
        export,
        vec![
            Condition::new(
                condition_types::VALID,
                ConditionStatus::True,
                "Valid",
                format!("ServiceExport {} is valid", export.key()),
            ),
            Condition::new(
                condition_types::CONFLICT,
                ConditionStatus::False,
                "NoConflict",
                format!("ServiceExport {} has no conflicts", export.key()),
            ),
        ],
    )
    .await
}

/// Mark `export` as invalid for `reason`
pub async fn mark_invalid(fleet: &dyn FleetApi, export: &ServiceExport, reason: &str) -> Result<()> {
    update_conditions(
        fleet,
        export,
        vec![Condition::new(
            condition_types::VALID,
            ConditionStatus::False,
            "Invalid",
            reason,
        )],
    )
    .await
}

#[cfg(test)]
pub(crate) mod testing {
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

    pub fn service(namespace: &str, name: &str, type_: &str, ports: &[(i32, &str)]) -> Service {
        let mut svc = Service {
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|(port, protocol)| ServicePort {
                            name: Some(format!("p{port}")),
                            port: *port,
                            protocol: Some(protocol.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        svc.metadata.name = Some(name.to_string());
        svc.metadata.namespace = Some(namespace.to_string());
        svc
    }
}

#[cfg(test)]
mod tests {
    use super::testing::service;
    use super::*;
    use crate::bus::testing::{east, export, west};
    use mockall::predicate::eq;
    use std::sync::{Arc, Mutex};

    #[test]
    fn identical_services_are_compatible() {
        let a = service("shop", "cart", "ClusterIP", &[(80, "TCP")]);
        assert!(check_compatible(&a, &a.clone()).is_ok());
    }

    #[test]
    fn type_mismatch_is_reported_with_both_types() {
        let a = service("shop", "cart", "ClusterIP", &[(80, "TCP")]);
        let b = service("shop", "cart", "NodePort", &[(80, "TCP")]);
        let err = check_compatible(&a, &b).unwrap_err();
        assert!(err
            .to_string()
            .contains("service type doesn't match: ClusterIP vs NodePort"));
    }

    #[test]
    fn protocol_mismatch_on_shared_port_conflicts() {
        let a = service("shop", "cart", "ClusterIP", &[(53, "UDP")]);
        let b = service("shop", "cart", "ClusterIP", &[(53, "TCP")]);
        assert!(check_compatible(&a, &b).is_err());
    }

    #[test]
    fn differing_port_sets_conflict() {
        let a = service("shop", "cart", "ClusterIP", &[(80, "TCP")]);
        let b = service("shop", "cart", "ClusterIP", &[(80, "TCP"), (443, "TCP")]);
        let err = check_compatible(&a, &b).unwrap_err();
        assert!(err.to_string().contains("spec.ports conflict"));
    }

    #[test]
    fn target_port_and_name_must_match() {
        let a = service("shop", "cart", "ClusterIP", &[(80, "TCP")]);
        let mut b = a.clone();
        if let Some(port) = b.spec.as_mut().and_then(|s| s.ports.as_mut()).and_then(|p| p.first_mut()) {
            port.target_port = Some(IntOrString::Int(9090));
        }
        let err = check_compatible(&a, &b).unwrap_err();
        assert!(err.to_string().contains("spec.ports conflict"));

        let mut c = a.clone();
        if let Some(port) = c.spec.as_mut().and_then(|s| s.ports.as_mut()).and_then(|p| p.first_mut()) {
            port.name = Some("grpc".to_string());
        }
        assert!(check_compatible(&a, &c).is_err());
    }

    #[test]
    fn node_port_and_defaults_are_ignored() {
        let a = service("shop", "cart", "NodePort", &[(80, "TCP")]);
        let mut b = a.clone();
        if let Some(port) = b.spec.as_mut().and_then(|s| s.ports.as_mut()).and_then(|p| p.first_mut()) {
            port.node_port = Some(30080);
            port.target_port = Some(IntOrString::Int(80));
        }
        assert!(check_compatible(&a, &b).is_ok());
    }

    #[test]
    fn import_spec_points_at_exporter_gateway() {
        let spec = import_spec(
            &export("shop", "cart", 80),
            &service("shop", "cart", "ClusterIP", &[(80, "TCP"), (9090, "TCP")]),
            &east(),
        );
        assert_eq!(spec.type_, "ClusterIP");
        assert_eq!(spec.ports.len(), 1);
        assert_eq!(spec.ports[0].port, 80);
        assert_eq!(spec.ports[0].endpoints[0].cluster_key, "us/east-1/prod/east");
        assert_eq!(
            spec.ports[0].endpoints[0].targets,
            vec!["10.0.1.20:8091/shop/cart".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_peer_service_never_conflicts() {
        let mut fleet = MockFleetApi::new();
        fleet.expect_get_service().returning(|_, _| Ok(None));
        let svc = service("shop", "cart", "ClusterIP", &[(80, "TCP")]);
        assert!(validate_against(&fleet, &export("shop", "cart", 80), &svc)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unfederated_peer_service_makes_export_ambiguous() {
        let mut fleet = MockFleetApi::new();
        fleet.expect_get_service().returning(|ns, name| {
            Ok(Some(service(ns, name, "ClusterIP", &[(80, "TCP")])))
        });
        fleet.expect_get_service_export().returning(|_, _| Ok(None));
        fleet.expect_get_service_import().returning(|_, _| Ok(None));

        let svc = service("shop", "cart", "ClusterIP", &[(80, "TCP")]);
        let err = validate_against(&fleet, &export("shop", "cart", 80), &svc)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ambiguous export shop/cart"));
    }

    #[tokio::test]
    async fn exported_peer_service_is_compared() {
        let mut fleet = MockFleetApi::new();
        fleet.expect_get_service().returning(|ns, name| {
            Ok(Some(service(ns, name, "NodePort", &[(80, "TCP")])))
        });
        fleet
            .expect_get_service_export()
            .returning(|ns, name| Ok(Some(export(ns, name, 80))));

        let svc = service("shop", "cart", "ClusterIP", &[(80, "TCP")]);
        let err = validate_against(&fleet, &export("shop", "cart", 80), &svc)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("service type doesn't match"));
    }

    // ===================================================================
    // Story: two clusters export the same service into a third
    // ===================================================================

    #[tokio::test]
    async fn imports_accumulate_and_drain_per_cluster() {
        let stored: Arc<Mutex<Option<ServiceImport>>> = Arc::new(Mutex::new(None));

        let mut fleet = MockFleetApi::new();
        let read = stored.clone();
        fleet
            .expect_get_service_import()
            .returning(move |_, _| Ok(read.lock().unwrap().clone()));
        fleet
            .expect_ensure_namespace()
            .with(eq("shop"))
            .returning(|_| Ok(()));
        let write = stored.clone();
        fleet.expect_apply_service_import().returning(move |imp| {
            *write.lock().unwrap() = Some(imp.clone());
            Ok(())
        });
        let delete = stored.clone();
        fleet
            .expect_delete_service_import()
            .times(1)
            .returning(move |_, _| {
                *delete.lock().unwrap() = None;
                Ok(())
            });

        let svc = service("shop", "cart", "ClusterIP", &[(80, "TCP")]);
        let exp = export("shop", "cart", 80);

        upsert_import(&fleet, &exp, &svc, &east()).await.unwrap();
        upsert_import(&fleet, &exp, &svc, &west()).await.unwrap();
        // Re-accepting east replaces its entry instead of duplicating it
        upsert_import(&fleet, &exp, &svc, &east()).await.unwrap();
        {
            let import = stored.lock().unwrap().clone().unwrap();
            assert_eq!(import.namespace().as_deref(), Some("shop"));
            assert_eq!(import.spec.ports[0].endpoints.len(), 2);
            assert_eq!(
                import.spec.cluster_keys(),
                vec!["us/east-1/prod/east", "us/west-2/prod/west"]
            );
        }

        remove_import_endpoints(&fleet, &exp, &east()).await.unwrap();
        assert_eq!(
            stored.lock().unwrap().as_ref().unwrap().spec.cluster_keys(),
            vec!["us/west-2/prod/west"]
        );

        remove_import_endpoints(&fleet, &exp, &west()).await.unwrap();
        assert!(stored.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn conflict_condition_carries_the_reason() {
        let mut fleet = MockFleetApi::new();
        fleet
            .expect_get_service_export()
            .returning(|ns, name| Ok(Some(export(ns, name, 80))));
        fleet
            .expect_patch_export_conditions()
            .withf(|ns, name, conditions| {
                ns == "shop"
                    && name == "cart"
                    && conditions.len() == 1
                    && conditions[0].type_ == condition_types::CONFLICT
                    && conditions[0].status == ConditionStatus::True
                    && conditions[0].message
                        == "ServiceExport shop/cart conflicts, spec.ports conflict"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        mark_conflict(&fleet, &export("shop", "cart", 80), "spec.ports conflict")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn clearing_conflict_sets_valid_and_no_conflict() {
        let mut fleet = MockFleetApi::new();
        fleet
            .expect_get_service_export()
            .returning(|ns, name| Ok(Some(export(ns, name, 80))));
        fleet
            .expect_patch_export_conditions()
            .withf(|_, _, conditions| {
                conditions.iter().any(|c| {
                    c.type_ == condition_types::VALID && c.status == ConditionStatus::True
                }) && conditions.iter().any(|c| {
                    c.type_ == condition_types::CONFLICT && c.status == ConditionStatus::False
                })
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        clear_conflict(&fleet, &export("shop", "cart", 80))
            .await
            .unwrap();
    }
}
