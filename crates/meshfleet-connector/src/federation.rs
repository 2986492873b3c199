//! Accept or reject a newly observed ServiceExport
//!
//! An export nobody imports yet is accepted outright. Otherwise every other
//! member cluster checks it against its own Service of the same name and the
//! first failure rejects it.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info};

use meshfleet_common::crd::{ClusterKey, ServiceExport};
use meshfleet_common::Result;

use crate::connector::Connector;

/// Outcome of evaluating one export
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Peers may import the export
    Accepted,
    /// The export conflicts; carries the reason
    Rejected(String),
    /// Nothing to decide here
    Ignored,
}

/// Decide on `export` of `service` from `exporter`.
///
/// Retryable failures while asking peers are returned as errors so the
/// caller can try again; every other failure becomes a rejection.
pub async fn evaluate(
    is_control_plane: bool,
    connectors: &[Arc<dyn Connector>],
    exporter: &ClusterKey,
    export: &ServiceExport,
    service: &Service,
) -> Result<Decision> {
    if !is_control_plane {
        return Ok(Decision::Ignored);
    }
    if export.is_blocked() {
        debug!(export = %export.key(), "export is invalid or conflicting, skipped");
        return Ok(Decision::Ignored);
    }

    let peers: Vec<&Arc<dyn Connector>> = connectors
        .iter()
        .filter(|c| &c.key() != exporter)
        .collect();

    let mut imported = false;
    for peer in &peers {
        if peer.service_import_exists(export).await? {
            imported = true;
            break;
        }
    }
    if !imported {
        info!(export = %export.key(), cluster = %exporter, "first export of service, accepted");
        return Ok(Decision::Accepted);
    }

    for peer in &peers {
        match peer.validate_service_export(export, service).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                info!(export = %export.key(), cluster = %exporter, peer = %peer.key(), error = %e, "export rejected");
                return Ok(Decision::Rejected(e.to_string()));
            }
        }
    }

    info!(export = %export.key(), cluster = %exporter, "export accepted");
    Ok(Decision::Accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{east, export, west};
    use crate::connector::MockConnector;
    use crate::fleet::testing::service;
    use meshfleet_common::crd::{
        condition_types, Condition, ConditionStatus, ServiceExportStatus,
    };
    use meshfleet_common::Error;

    fn connector(key: ClusterKey, imports: bool, validation: Option<Error>) -> Arc<dyn Connector> {
        let mut mock = MockConnector::new();
        mock.expect_key().return_const(key);
        mock.expect_service_import_exists()
            .returning(move |_| Ok(imports));
        let mut validation = Some(validation);
        mock.expect_validate_service_export()
            .returning(move |_, _| match validation.take().flatten() {
                Some(e) => Err(e),
                None => Ok(()),
            });
        Arc::new(mock)
    }

    fn svc() -> Service {
        service("shop", "cart", "ClusterIP", &[(80, "TCP")])
    }

    #[tokio::test]
    async fn data_plane_clusters_never_decide() {
        let decision = evaluate(false, &[], &east().cluster_key, &export("shop", "cart", 80), &svc())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Ignored);
    }

    #[tokio::test]
    async fn blocked_exports_are_ignored() {
        let mut exp = export("shop", "cart", 80);
        exp.status = Some(ServiceExportStatus {
            conditions: vec![Condition::new(
                condition_types::CONFLICT,
                ConditionStatus::True,
                "Conflict",
                "conflicts",
            )],
        });
        let connectors = vec![connector(west().cluster_key, true, None)];
        let decision = evaluate(true, &connectors, &east().cluster_key, &exp, &svc())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Ignored);
    }

    // ===================================================================
    // Story: first export is accepted, a mismatching second one is not
    // ===================================================================

    #[tokio::test]
    async fn first_export_is_accepted_without_validation() {
        let mut peer = MockConnector::new();
        peer.expect_key().return_const(west().cluster_key);
        peer.expect_service_import_exists().returning(|_| Ok(false));
        peer.expect_validate_service_export().never();
        let connectors: Vec<Arc<dyn Connector>> = vec![
            connector(east().cluster_key, true, None),
            Arc::new(peer),
        ];

        let decision = evaluate(true, &connectors, &east().cluster_key, &export("shop", "cart", 80), &svc())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Accepted);
    }

    #[tokio::test]
    async fn type_mismatch_in_a_peer_rejects() {
        let connectors = vec![
            connector(east().cluster_key, false, None),
            connector(
                west().cluster_key,
                true,
                Some(Error::validation_for(
                    "ServiceExport",
                    "service type doesn't match: ClusterIP vs NodePort",
                )),
            ),
        ];

        let decision = evaluate(true, &connectors, &east().cluster_key, &export("shop", "cart", 80), &svc())
            .await
            .unwrap();
        match decision {
            Decision::Rejected(reason) => {
                assert!(reason.contains("service type doesn't match: ClusterIP vs NodePort"))
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn compatible_peers_accept() {
        let connectors = vec![connector(west().cluster_key, true, None)];
        let decision = evaluate(true, &connectors, &east().cluster_key, &export("shop", "cart", 80), &svc())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Accepted);
    }

    #[tokio::test]
    async fn transient_peer_failures_are_returned() {
        let connectors = vec![connector(
            west().cluster_key,
            true,
            Some(Error::transient("kube", "connection reset")),
        )];
        let result = evaluate(true, &connectors, &east().cluster_key, &export("shop", "cart", 80), &svc()).await;
        assert!(result.is_err());
    }
}
