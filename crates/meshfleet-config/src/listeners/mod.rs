//! Mesh config change listeners
//!
//! Registration order matters: the ingress listener writes the listener
//! flags into `main.json` before the TLS listener adds the certificate.

mod ingress;
mod logging;
mod proxy_profile;
mod rolling;
mod tls;

pub use ingress::IngressListener;
pub use logging::LoggingListener;
pub use proxy_profile::ProxyProfileImageListener;
pub use rolling::RollingRestartListener;
pub use tls::TlsCertListener;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, ServicePort};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::crd::{ProxyProfile, Sidecar};
use meshfleet_common::kube_utils::{ignore_not_found, restart_patch};
use meshfleet_common::{
    Result, FIELD_MANAGER, INGRESS_CONTROLLER_NAME, PART_OF_LABEL, PART_OF_VALUE,
};
use meshfleet_repo::RepoClient;

use crate::cert::CertManager;
use crate::store::MeshConfigListener;

/// Object Store operations the listeners perform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ListenerKubeClient: Send + Sync {
    /// Replace the ports of the mesh ingress Service
    async fn patch_ingress_service_ports(&self, ports: Vec<ServicePort>) -> Result<()>;

    /// Roll the mesh ingress Deployment
    async fn restart_ingress(&self) -> Result<()>;

    /// Roll every Deployment labelled as part of the mesh
    async fn restart_mesh_deployments(&self) -> Result<()>;

    /// Decoded data of a Secret in the mesh namespace
    async fn secret_data(&self, name: &str) -> Result<Option<BTreeMap<String, String>>>;

    /// All ProxyProfiles
    async fn list_proxy_profiles(&self) -> Result<Vec<ProxyProfile>>;

    /// Overwrite the sidecars of a ProxyProfile
    async fn replace_sidecars(&self, profile: &str, sidecars: Vec<Sidecar>) -> Result<()>;
}

/// [`ListenerKubeClient`] over the API server
pub struct KubeListenerClient {
    client: Client,
    namespace: String,
}

impl KubeListenerClient {
    /// Operate on mesh objects in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn restart_deployment(&self, api: &Api<Deployment>, name: &str) -> Result<()> {
        let patch = restart_patch(Utc::now());
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        debug!(deployment = %name, "stamped restart annotation");
        Ok(())
    }
}

#[async_trait]
impl ListenerKubeClient for KubeListenerClient {
    async fn patch_ingress_service_ports(&self, ports: Vec<ServicePort>) -> Result<()> {
        let api: Api<k8s_openapi::api::core::v1::Service> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let patch = serde_json::json!({ "spec": { "ports": ports } });
        api.patch(
            INGRESS_CONTROLLER_NAME,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn restart_ingress(&self) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        self.restart_deployment(&api, INGRESS_CONTROLLER_NAME).await
    }

    async fn restart_mesh_deployments(&self) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&format!("{}={}", PART_OF_LABEL, PART_OF_VALUE));
        for deployment in api.list(&params).await? {
            let name = deployment.name_any();
            if let Err(e) = self.restart_deployment(&api, &name).await {
                warn!(deployment = %name, error = %e, "failed to restart mesh deployment");
            }
        }
        Ok(())
    }

    async fn secret_data(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let Some(secret) = ignore_not_found(api.get(name).await)? else {
            return Ok(None);
        };
        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| String::from_utf8(v.0).ok().map(|s| (k, s)))
            .collect();
        Ok(Some(data))
    }

    async fn list_proxy_profiles(&self) -> Result<Vec<ProxyProfile>> {
        let api: Api<ProxyProfile> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_sidecars(&self, profile: &str, sidecars: Vec<Sidecar>) -> Result<()> {
        let api: Api<ProxyProfile> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "sidecars": sidecars } });
        api.patch(profile, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Dependencies shared by the listeners
#[derive(Clone)]
pub struct ListenerContext {
    /// Repo holding the ingress pipeline
    pub repo: Arc<dyn RepoClient>,
    /// Object Store access
    pub kube: Arc<dyn ListenerKubeClient>,
    /// Issues the ingress certificate
    pub certs: Arc<dyn CertManager>,
    /// Namespace of the mesh components
    pub mesh_namespace: String,
}

/// The standard listener list in dispatch order
pub fn default_listeners(ctx: &ListenerContext) -> Vec<Arc<dyn MeshConfigListener>> {
    vec![
        Arc::new(IngressListener::new(ctx.clone())),
        Arc::new(TlsCertListener::new(ctx.clone())),
        Arc::new(LoggingListener::new(ctx.clone())),
        Arc::new(ProxyProfileImageListener::new(ctx.clone())),
        Arc::new(RollingRestartListener::new(ctx.clone())),
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cert::MockCertManager;
    use meshfleet_common::mesh_config::{sample_json, MeshConfig};
    use meshfleet_repo::MemoryRepoClient;

    pub fn sample() -> MeshConfig {
        MeshConfig::parse(sample_json()).unwrap()
    }

    /// Repo with the base ingress codebase seeded
    pub async fn seeded_repo() -> Arc<MemoryRepoClient> {
        let repo = Arc::new(MemoryRepoClient::new());
        repo.create_codebase(meshfleet_common::INGRESS_BASE_PATH)
            .await
            .unwrap();
        repo.upsert_file("/base/ingress/config/main.json", r#"{"logLevel":"info"}"#)
            .await
            .unwrap();
        repo
    }

    pub fn context(
        repo: Arc<MemoryRepoClient>,
        kube: MockListenerKubeClient,
        certs: MockCertManager,
    ) -> ListenerContext {
        ListenerContext {
            repo,
            kube: Arc::new(kube),
            certs: Arc::new(certs),
            mesh_namespace: meshfleet_common::MESH_NAMESPACE.to_string(),
        }
    }

    pub async fn main_json(repo: &MemoryRepoClient) -> serde_json::Value {
        serde_json::from_str(&repo.file("/base/ingress/config/main.json").unwrap()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::cert::MockCertManager;
    use crate::store::MeshConfigStore;

    // =========================================================================
    // Story: TLS toggle through the whole listener chain
    // =========================================================================

    #[tokio::test]
    async fn enabling_tls_writes_flags_then_certificate() {
        let repo = seeded_repo().await;

        let mut kube = MockListenerKubeClient::new();
        kube.expect_patch_ingress_service_ports()
            .times(2)
            .returning(|_| Ok(()));
        kube.expect_restart_ingress().times(2).returning(|| Ok(()));

        let mut certs = MockCertManager::new();
        certs
            .expect_issue_certificate()
            .times(1)
            .returning(|_, _, _| {
                Ok(meshfleet_common::pki::IssuedCertificate {
                    cert_pem: "CERT".to_string(),
                    key_pem: "KEY".to_string(),
                    ca_pem: "CA".to_string(),
                })
            });

        let ctx = context(repo.clone(), kube, certs);
        let store = MeshConfigStore::new(default_listeners(&ctx));

        store.update(sample()).await;
        let mut tls_on = sample();
        tls_on.ingress.tls.enabled = true;
        store.update(tls_on).await;

        let doc = main_json(&repo).await;
        assert_eq!(doc["logLevel"], "info");
        assert_eq!(doc["tls"]["enabled"], true);
        assert_eq!(doc["tls"]["listen"], 443);
        assert_eq!(doc["tls"]["certificate"]["cert"], "CERT");
        assert_eq!(doc["tls"]["certificate"]["ca"], "CA");
    }
}
