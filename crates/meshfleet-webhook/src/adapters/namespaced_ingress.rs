//! NamespacedIngress defaulting and validation

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PodSecurityContext, SeccompProfile, SecurityContext};
use kube::ResourceExt;

use meshfleet_common::crd::NamespacedIngress;
use meshfleet_common::{Error, Result};

use crate::adapter::{Defaulter, Validator};
use crate::lookup::AdmissionLookup;

/// Service account of namespaced ingress controllers
pub const DEFAULT_SERVICE_ACCOUNT: &str = "meshfleet-namespaced-ingress";
/// Log level of namespaced ingress controllers
pub const DEFAULT_LOG_LEVEL: i32 = 2;
/// Upstream port for SSL passthrough
pub const DEFAULT_UPSTREAM_PORT: i32 = 443;
/// Non-root user and group of the controller
const NON_ROOT_ID: i64 = 65532;

/// Fills controller workload settings
pub struct NamespacedIngressDefaulter;

impl Defaulter<NamespacedIngress> for NamespacedIngressDefaulter {
    fn apply_defaults(&self, obj: &mut NamespacedIngress) {
        let spec = &mut obj.spec;
        spec.service_account_name
            .get_or_insert_with(|| DEFAULT_SERVICE_ACCOUNT.to_string());
        spec.log_level.get_or_insert(DEFAULT_LOG_LEVEL);
        spec.replicas.get_or_insert(1);

        if let Some(tls) = &mut spec.tls {
            let passthrough = tls.ssl_passthrough.get_or_insert_with(Default::default);
            if passthrough.upstream_port == 0 {
                passthrough.upstream_port = DEFAULT_UPSTREAM_PORT;
            }
        }

        spec.pod_security_context
            .get_or_insert_with(|| PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(NON_ROOT_ID),
                run_as_group: Some(NON_ROOT_ID),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        spec.security_context.get_or_insert_with(|| SecurityContext {
            allow_privilege_escalation: Some(false),
            ..Default::default()
        });
    }
}

/// Allows one NamespacedIngress per namespace with usable listeners
pub struct NamespacedIngressValidator {
    lookup: Arc<dyn AdmissionLookup>,
}

impl NamespacedIngressValidator {
    /// Validator reading existing objects through `lookup`
    pub fn new(lookup: Arc<dyn AdmissionLookup>) -> Self {
        Self { lookup }
    }
}

fn check_port(field: &str, port: i32) -> Result<()> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(Error::validation_for_field(
            "NamespacedIngress",
            field,
            format!("port {port} out of range 1-65535"),
        ))
    }
}

fn check_spec(obj: &NamespacedIngress) -> Result<()> {
    if let Some(http) = obj.spec.http.as_ref().filter(|h| h.enabled) {
        check_port("spec.http.port", http.port)?;
    }
    if let Some(tls) = obj.spec.tls.as_ref().filter(|t| t.enabled) {
        check_port("spec.tls.port", tls.port)?;
        if let Some(passthrough) = tls.ssl_passthrough.as_ref().filter(|p| p.enabled) {
            check_port("spec.tls.sslPassthrough.upstreamPort", passthrough.upstream_port)?;
        }
    }
    Ok(())
}

#[async_trait]
impl Validator<NamespacedIngress> for NamespacedIngressValidator {
    async fn validate_create(&self, obj: &NamespacedIngress) -> Result<()> {
        check_spec(obj)?;
        let namespace = obj.namespace().unwrap_or_default();
        let existing = self.lookup.list_namespaced_ingresses(&namespace).await?;
        if let Some(other) = existing.iter().find(|n| n.name_any() != obj.name_any()) {
            return Err(Error::validation_for(
                "NamespacedIngress",
                format!(
                    "namespace {namespace} already has NamespacedIngress {}, only one is allowed",
                    other.name_any()
                ),
            ));
        }
        Ok(())
    }

    async fn validate_update(&self, _old: &NamespacedIngress, new: &NamespacedIngress) -> Result<()> {
        check_spec(new)
    }
}
