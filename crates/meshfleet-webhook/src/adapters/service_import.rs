//! ServiceImport validation

use async_trait::async_trait;

use meshfleet_common::crd::{ClusterKey, ServiceImport};
use meshfleet_common::{Error, Result};

use crate::adapter::Validator;

/// Checks ports and endpoint ownership
pub struct ServiceImportValidator;

fn check_spec(import: &ServiceImport) -> Result<()> {
    for port in &import.spec.ports {
        if !(1..=65535).contains(&port.port) {
            return Err(Error::validation_for_field(
                "ServiceImport",
                "spec.ports.port",
                format!("port {} out of range 1-65535", port.port),
            ));
        }
        for endpoint in &port.endpoints {
            endpoint.cluster_key.parse::<ClusterKey>().map_err(|e| {
                Error::validation_for_field(
                    "ServiceImport",
                    "spec.ports.endpoints.clusterKey",
                    e.to_string(),
                )
            })?;
        }
    }
    Ok(())
}

#[async_trait]
impl Validator<ServiceImport> for ServiceImportValidator {
    async fn validate_create(&self, obj: &ServiceImport) -> Result<()> {
        check_spec(obj)
    }

    async fn validate_update(&self, _old: &ServiceImport, new: &ServiceImport) -> Result<()> {
        check_spec(new)
    }
}
