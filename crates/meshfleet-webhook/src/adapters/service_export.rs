//! ServiceExport defaulting and validation

use std::collections::BTreeSet;

use async_trait::async_trait;
use kube::ResourceExt;

use meshfleet_common::crd::{LoadBalancerType, ServiceExport};
use meshfleet_common::{Error, Result};

use crate::adapter::{Defaulter, Validator};

/// Fills rule paths and the load balancer type
pub struct ServiceExportDefaulter;

impl Defaulter<ServiceExport> for ServiceExportDefaulter {
    fn apply_defaults(&self, obj: &mut ServiceExport) {
        let default_path = format!(
            "/{}/{}",
            obj.namespace().unwrap_or_default(),
            obj.name_any()
        );
        for rule in &mut obj.spec.rules {
            if rule.path.is_empty() {
                rule.path = default_path.clone();
            }
        }
        obj.spec
            .load_balancer
            .get_or_insert(LoadBalancerType::RoundRobinLoadBalancer);
    }
}

/// Checks rules are routable
pub struct ServiceExportValidator;

fn invalid(field: &str, msg: impl Into<String>) -> Error {
    Error::validation_for_field("ServiceExport", field, msg)
}

fn check_spec(export: &ServiceExport) -> Result<()> {
    let rules = &export.spec.rules;
    if rules.is_empty() {
        return Err(invalid("spec.rules", "at least one rule is required"));
    }

    let mut ports = BTreeSet::new();
    for rule in rules {
        if !(1..=65535).contains(&rule.port_number) {
            return Err(invalid(
                "spec.rules.portNumber",
                format!("port {} out of range 1-65535", rule.port_number),
            ));
        }
        if !ports.insert(rule.port_number) {
            return Err(invalid(
                "spec.rules.portNumber",
                format!("port {} is exported more than once", rule.port_number),
            ));
        }
        if !rule.path.starts_with('/') {
            return Err(invalid(
                "spec.rules.path",
                format!("path {:?} must start with '/'", rule.path),
            ));
        }
    }

    if let Some(rewrite) = &export.spec.path_rewrite {
        if rewrite.from.is_empty() {
            return Err(invalid("spec.pathRewrite.from", "from must not be empty"));
        }
    }
    Ok(())
}

#[async_trait]
impl Validator<ServiceExport> for ServiceExportValidator {
    async fn validate_create(&self, obj: &ServiceExport) -> Result<()> {
        check_spec(obj)
    }

    async fn validate_update(&self, _old: &ServiceExport, new: &ServiceExport) -> Result<()> {
        check_spec(new)
    }
}
