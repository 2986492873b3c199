//! Object Store reads needed by admission decisions

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, ListParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use meshfleet_common::crd::{Cluster, NamespacedIngress, ProxyProfile};
use meshfleet_common::kube_utils::ignore_not_found;
use meshfleet_common::Result;

/// Trait abstracting the reads admission handlers perform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdmissionLookup: Send + Sync {
    /// Every Cluster
    async fn list_clusters(&self) -> Result<Vec<Cluster>>;

    /// NamespacedIngresses of `namespace`
    async fn list_namespaced_ingresses(&self, namespace: &str) -> Result<Vec<NamespacedIngress>>;

    /// Every ProxyProfile
    async fn list_proxy_profiles(&self) -> Result<Vec<ProxyProfile>>;

    /// Labels of `namespace`; empty when it does not exist
    async fn namespace_labels(&self, namespace: &str) -> Result<BTreeMap<String, String>>;

    /// Whether Secret `namespace/name` exists
    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// Real Kubernetes client implementation
pub struct KubeAdmissionLookup {
    client: Client,
}

impl KubeAdmissionLookup {
    /// Create a new lookup wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AdmissionLookup for KubeAdmissionLookup {
    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_namespaced_ingresses(&self, namespace: &str) -> Result<Vec<NamespacedIngress>> {
        let api: Api<NamespacedIngress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_proxy_profiles(&self) -> Result<Vec<ProxyProfile>> {
        let api: Api<ProxyProfile> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn namespace_labels(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(ignore_not_found(api.get(namespace).await)?
            .and_then(|ns| ns.metadata.labels)
            .unwrap_or_default())
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(ignore_not_found(api.get_metadata(name).await)?.is_some())
    }
}
