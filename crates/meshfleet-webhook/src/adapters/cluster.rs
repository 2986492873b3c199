//! Cluster defaulting and validation

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use meshfleet_common::crd::{Cluster, ClusterMode};
use meshfleet_common::{Error, Result, LOCAL_CLUSTER_NAME};

use crate::adapter::{Defaulter, Validator};
use crate::lookup::AdmissionLookup;

/// Fills in the connector replica count
pub struct ClusterDefaulter;

impl Defaulter<Cluster> for ClusterDefaulter {
    fn apply_defaults(&self, obj: &mut Cluster) {
        if obj.spec.replicas <= 0 {
            obj.spec.replicas = 1;
        }
    }
}

/// Checks the reserved name, OutCluster connection details and the single
/// InCluster rule
pub struct ClusterValidator {
    lookup: Arc<dyn AdmissionLookup>,
}

impl ClusterValidator {
    /// Validator reading existing Clusters through `lookup`
    pub fn new(lookup: Arc<dyn AdmissionLookup>) -> Self {
        Self { lookup }
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

fn check_spec(cluster: &Cluster) -> Result<()> {
    let invalid = |field: &str, msg: &str| Err(Error::validation_for_field("Cluster", field, msg));
    if cluster.spec.mode == ClusterMode::InCluster {
        if cluster.name_any() != LOCAL_CLUSTER_NAME {
            return invalid(
                "metadata.name",
                "the InCluster Cluster must be named 'local'",
            );
        }
        return Ok(());
    }
    if cluster.name_any() == LOCAL_CLUSTER_NAME {
        return invalid(
            "metadata.name",
            "'local' is reserved for the InCluster Cluster, please choose another name",
        );
    }
    if blank(&cluster.spec.gateway) {
        return invalid("spec.gateway", "gateway must be set in OutCluster mode");
    }
    if blank(&cluster.spec.kubeconfig) {
        return invalid("spec.kubeconfig", "kubeconfig must be set in OutCluster mode");
    }
    if blank(&cluster.spec.control_plane_repo_root_url) {
        return invalid(
            "spec.controlPlaneRepoRootUrl",
            "controlPlaneRepoRootUrl must be set in OutCluster mode",
        );
    }
    Ok(())
}

#[async_trait]
impl Validator<Cluster> for ClusterValidator {
    async fn validate_create(&self, obj: &Cluster) -> Result<()> {
        check_spec(obj)?;
        if obj.is_in_cluster() {
            let existing = self.lookup.list_clusters().await?;
            if let Some(other) = existing.iter().find(|c| c.is_in_cluster()) {
                return Err(Error::validation_for_field(
                    "Cluster",
                    "spec.mode",
                    format!("InCluster Cluster {} already exists", other.name_any()),
                ));
            }
        }
        Ok(())
    }

    async fn validate_update(&self, old: &Cluster, new: &Cluster) -> Result<()> {
        if old.spec.mode != new.spec.mode {
            return Err(Error::validation_for_field(
                "Cluster",
                "spec.mode",
                "mode cannot be changed",
            ));
        }
        check_spec(new)
    }
}
