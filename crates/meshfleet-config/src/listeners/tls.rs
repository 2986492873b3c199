//! Ingress certificate issuance

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::pki::service_dns_names;
use meshfleet_common::{Result, INGRESS_BASE_PATH, INGRESS_CONTROLLER_NAME};
use meshfleet_repo::documents::{self, set_value, CONFIG_DIR, MAIN_JSON};

use super::ListenerContext;
use crate::cert::DEFAULT_CERT_TTL;
use crate::store::MeshConfigListener;

/// Issues the ingress server certificate when TLS is switched on or its
/// listener changes, and stores it in the ingress pipeline
pub struct TlsCertListener {
    ctx: ListenerContext,
}

impl TlsCertListener {
    /// Listener over `ctx`
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }

    async fn issue(&self, config: &MeshConfig) -> Result<()> {
        let dns_names = service_dns_names(INGRESS_CONTROLLER_NAME, &self.ctx.mesh_namespace);
        let cert = self
            .ctx
            .certs
            .issue_certificate("ingress", DEFAULT_CERT_TTL, &dns_names)
            .await?;

        let tls = &config.ingress.tls;
        documents::update_json_document(
            self.ctx.repo.as_ref(),
            INGRESS_BASE_PATH,
            CONFIG_DIR,
            MAIN_JSON,
            |doc| {
                set_value(doc, "tls.enabled", json!(true))?;
                set_value(doc, "tls.listen", json!(tls.listen))?;
                set_value(doc, "tls.mTLS", json!(tls.mtls))?;
                set_value(
                    doc,
                    "tls.certificate",
                    json!({ "cert": cert.cert_pem, "key": cert.key_pem, "ca": cert.ca_pem }),
                )
            },
        )
        .await?;
        info!("ingress certificate issued");
        Ok(())
    }
}

fn tls_on(config: &MeshConfig) -> bool {
    config.ingress.enabled && config.ingress.tls.enabled
}

#[async_trait]
impl MeshConfigListener for TlsCertListener {
    fn name(&self) -> &'static str {
        "tls-cert"
    }

    async fn on_create(&self, config: Arc<MeshConfig>) -> Result<()> {
        if tls_on(&config) {
            self.issue(&config).await?;
        }
        Ok(())
    }

    async fn on_update(&self, old: Arc<MeshConfig>, new: Arc<MeshConfig>) -> Result<()> {
        if !tls_on(&new) {
            return Ok(());
        }
        let (o, n) = (&old.ingress.tls, &new.ingress.tls);
        if !tls_on(&old) || o.listen != n.listen || o.mtls != n.mtls {
            self.issue(&new).await?;
        }
        Ok(())
    }

    async fn on_delete(&self, _config: Arc<MeshConfig>) -> Result<()> {
        Ok(())
    }
}
