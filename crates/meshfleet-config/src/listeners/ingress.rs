//! Ingress listener flags in the base ingress `main.json`

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::json;
use tracing::{info, warn};

use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{Result, INGRESS_BASE_PATH};
use meshfleet_repo::documents::{self, set_value, CONFIG_DIR, MAIN_JSON};

use super::ListenerContext;
use crate::store::MeshConfigListener;

/// Mirrors the ingress section of the mesh config into the ingress
/// pipeline, its Service, and its Deployment
pub struct IngressListener {
    ctx: ListenerContext,
}

impl IngressListener {
    /// Listener over `ctx`
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }

    async fn write_main_json(&self, config: &MeshConfig) -> Result<()> {
        let http = &config.ingress.http;
        let tls = &config.ingress.tls;
        let http_enabled = config.ingress.enabled && http.enabled;
        let tls_enabled = config.ingress.enabled && tls.enabled;
        let passthrough = tls.ssl_passthrough.clone();

        documents::update_json_document(
            self.ctx.repo.as_ref(),
            INGRESS_BASE_PATH,
            CONFIG_DIR,
            MAIN_JSON,
            |doc| {
                set_value(
                    doc,
                    "http",
                    json!({ "enabled": http_enabled, "listen": http.listen }),
                )?;
                set_value(doc, "tls.enabled", json!(tls_enabled))?;
                set_value(doc, "tls.listen", json!(tls.listen))?;
                set_value(doc, "tls.mTLS", json!(tls.mtls))?;
                set_value(
                    doc,
                    "sslPassthrough",
                    json!({
                        "enabled": tls_enabled && passthrough.enabled,
                        "upstreamPort": passthrough.upstream_port,
                    }),
                )
            },
        )
        .await?;
        Ok(())
    }

    async fn update_service(&self, config: &MeshConfig) -> Result<()> {
        let ports = service_ports(config);
        if ports.is_empty() {
            warn!("both ingress listeners are disabled, leaving the ingress Service untouched");
            return Ok(());
        }
        self.ctx.kube.patch_ingress_service_ports(ports).await
    }

    async fn apply(&self, config: &MeshConfig, service_changed: bool) -> Result<()> {
        self.write_main_json(config).await?;
        if service_changed {
            self.update_service(config).await?;
        }
        self.ctx.kube.restart_ingress().await?;
        info!("ingress configuration updated");
        Ok(())
    }
}

/// Ports of the ingress Service: the bind port routed to the listen port,
/// with a fixed node port when configured
pub fn service_ports(config: &MeshConfig) -> Vec<ServicePort> {
    let mut ports = Vec::new();
    if !config.ingress.enabled {
        return ports;
    }
    let http = &config.ingress.http;
    if http.enabled {
        ports.push(ServicePort {
            name: Some("http".to_string()),
            protocol: Some("TCP".to_string()),
            port: http.bind,
            target_port: Some(IntOrString::Int(http.listen)),
            node_port: (http.node_port > 0).then_some(http.node_port),
            ..Default::default()
        });
    }
    let tls = &config.ingress.tls;
    if tls.enabled {
        ports.push(ServicePort {
            name: Some("https".to_string()),
            protocol: Some("TCP".to_string()),
            port: tls.bind,
            target_port: Some(IntOrString::Int(tls.listen)),
            node_port: (tls.node_port > 0).then_some(tls.node_port),
            ..Default::default()
        });
    }
    ports
}

fn document_changed(old: &MeshConfig, new: &MeshConfig) -> bool {
    let (o, n) = (&old.ingress, &new.ingress);
    o.enabled != n.enabled
        || o.http != n.http
        || o.tls.enabled != n.tls.enabled
        || o.tls.listen != n.tls.listen
        || o.tls.mtls != n.tls.mtls
        || o.tls.ssl_passthrough != n.tls.ssl_passthrough
}

fn service_changed(old: &MeshConfig, new: &MeshConfig) -> bool {
    service_ports(old) != service_ports(new)
}

#[async_trait]
impl MeshConfigListener for IngressListener {
    fn name(&self) -> &'static str {
        "ingress"
    }

    async fn on_create(&self, config: Arc<MeshConfig>) -> Result<()> {
        if !config.ingress.enabled {
            return Ok(());
        }
        self.apply(&config, true).await
    }

    async fn on_update(&self, old: Arc<MeshConfig>, new: Arc<MeshConfig>) -> Result<()> {
        if !new.ingress.enabled && !old.ingress.enabled {
            return Ok(());
        }
        if !document_changed(&old, &new) && !service_changed(&old, &new) {
            return Ok(());
        }
        self.apply(&new, service_changed(&old, &new)).await
    }

    async fn on_delete(&self, _config: Arc<MeshConfig>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::MockListenerKubeClient;
    use super::*;
    use crate::cert::MockCertManager;

    #[test]
    fn service_ports_follow_listener_flags() {
        let mut config = sample();
        let ports = service_ports(&config);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
        assert_eq!(ports[0].port, 8000);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(80)));
        assert_eq!(ports[0].node_port, Some(30508));

        config.ingress.tls.enabled = true;
        config.ingress.tls.node_port = 0;
        let ports = service_ports(&config);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].name.as_deref(), Some("https"));
        assert_eq!(ports[1].node_port, None);
    }

    #[tokio::test]
    async fn create_writes_flags_and_patches_service() {
        let repo = seeded_repo().await;
        let mut kube = MockListenerKubeClient::new();
        kube.expect_patch_ingress_service_ports()
            .withf(|ports| ports.len() == 1)
            .times(1)
            .returning(|_| Ok(()));
        kube.expect_restart_ingress().times(1).returning(|| Ok(()));

        let listener = IngressListener::new(context(repo.clone(), kube, MockCertManager::new()));
        listener.on_create(Arc::new(sample())).await.unwrap();

        let doc = main_json(&repo).await;
        assert_eq!(doc["http"], json!({ "enabled": true, "listen": 80 }));
        assert_eq!(doc["tls"]["enabled"], false);
        assert_eq!(doc["sslPassthrough"]["upstreamPort"], 443);
        assert_eq!(repo.commit_count(INGRESS_BASE_PATH), 1);
    }

    #[tokio::test]
    async fn unrelated_update_touches_nothing() {
        let repo = seeded_repo().await;
        let mut kube = MockListenerKubeClient::new();
        kube.expect_patch_ingress_service_ports().never();
        kube.expect_restart_ingress().never();

        let listener = IngressListener::new(context(repo.clone(), kube, MockCertManager::new()));
        let mut new = sample();
        new.logging.enabled = true;
        listener
            .on_update(Arc::new(sample()), Arc::new(new))
            .await
            .unwrap();
        assert_eq!(repo.commit_count(INGRESS_BASE_PATH), 0);
    }

    #[tokio::test]
    async fn listen_change_rewrites_document_and_service() {
        let repo = seeded_repo().await;
        let mut kube = MockListenerKubeClient::new();
        kube.expect_patch_ingress_service_ports()
            .withf(|ports| ports[0].target_port == Some(IntOrString::Int(8080)))
            .times(1)
            .returning(|_| Ok(()));
        kube.expect_restart_ingress().times(1).returning(|| Ok(()));

        let listener = IngressListener::new(context(repo.clone(), kube, MockCertManager::new()));
        let mut new = sample();
        new.ingress.http.listen = 8080;
        listener
            .on_update(Arc::new(sample()), Arc::new(new))
            .await
            .unwrap();
        assert_eq!(main_json(&repo).await["http"]["listen"], 8080);
    }
}
