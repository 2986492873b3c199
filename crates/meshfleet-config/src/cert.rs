//! Certificate issuance for the mesh ingress and the admission webhook
//!
//! The CA lives in the CA bundle Secret. With the `archon` manager a missing
//! Secret is created with a fresh CA; with `manual` it must already exist.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tokio::sync::OnceCell;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use meshfleet_common::kube_utils::ignore_not_found;
use meshfleet_common::mesh_config::{CertificateManagerKind, MeshConfig};
use meshfleet_common::pki::{CertificateAuthority, IssuedCertificate};
use meshfleet_common::{Error, Result, FIELD_MANAGER};

/// Secret key holding the CA certificate
pub const CA_CERT_KEY: &str = "ca.crt";
/// Secret key holding the CA private key
pub const CA_KEY_KEY: &str = "ca.key";
/// Common name of the generated CA
pub const CA_COMMON_NAME: &str = "meshfleet-ca";
/// Lifetime of certificates issued for mesh components
pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

/// Issues leaf certificates signed by the mesh CA
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertManager: Send + Sync {
    /// Issue a certificate for `common_name` with the given SANs
    async fn issue_certificate(
        &self,
        common_name: &str,
        ttl: Duration,
        dns_names: &[String],
    ) -> Result<IssuedCertificate>;

    /// PEM of the CA certificate
    async fn ca_bundle(&self) -> Result<String>;
}

/// Persistence for CA material
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CaStore: Send + Sync {
    /// Stored `(cert_pem, key_pem)`, if any
    async fn load(&self) -> Result<Option<(String, String)>>;

    /// Persist CA material
    async fn save(&self, cert_pem: &str, key_pem: &str) -> Result<()>;
}

/// [`CaStore`] backed by the CA bundle Secret
pub struct KubeCaStore {
    client: Client,
    name: String,
    namespace: String,
}

impl KubeCaStore {
    /// Store in Secret `namespace/name`
    pub fn new(client: Client, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Store named by the mesh config's certificate section
    pub fn from_mesh_config(client: Client, config: &MeshConfig, mesh_namespace: &str) -> Self {
        Self::new(
            client,
            config.certificate.ca_bundle_name.clone(),
            config.ca_bundle_namespace(mesh_namespace),
        )
    }
}

fn secret_string(data: &BTreeMap<String, ByteString>, key: &str) -> Option<String> {
    data.get(key)
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl CaStore for KubeCaStore {
    async fn load(&self) -> Result<Option<(String, String)>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let Some(secret) = ignore_not_found(api.get(&self.name).await)? else {
            return Ok(None);
        };
        let data = secret.data.unwrap_or_default();
        match (
            secret_string(&data, CA_CERT_KEY),
            secret_string(&data, CA_KEY_KEY),
        ) {
            (Some(cert), Some(key)) => Ok(Some((cert, key))),
            _ => Ok(None),
        }
    }

    async fn save(&self, cert_pem: &str, key_pem: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": self.name, "namespace": self.namespace },
            "type": "Opaque",
            "stringData": { CA_CERT_KEY: cert_pem, CA_KEY_KEY: key_pem },
        });
        api.patch(
            &self.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        Ok(())
    }
}

/// [`CertManager`] issuing from an in-process CA loaded from a [`CaStore`]
pub struct ArchonCertManager {
    store: Arc<dyn CaStore>,
    kind: CertificateManagerKind,
    ca: OnceCell<CertificateAuthority>,
}

impl ArchonCertManager {
    /// Manager that generates and persists a CA when none is stored
    pub fn new(store: Arc<dyn CaStore>) -> Self {
        Self::with_kind(store, CertificateManagerKind::Archon)
    }

    /// Manager whose CA handling follows `kind`
    pub fn with_kind(store: Arc<dyn CaStore>, kind: CertificateManagerKind) -> Self {
        Self {
            store,
            kind,
            ca: OnceCell::new(),
        }
    }

    async fn authority(&self) -> Result<&CertificateAuthority> {
        self.ca
            .get_or_try_init(|| async {
                if let Some((cert, key)) = self.store.load().await? {
                    return Ok(CertificateAuthority::from_pem(&cert, &key)?);
                }
                match self.kind {
                    CertificateManagerKind::Manual => Err(Error::fatal(
                        "certificate manager is manual but the CA bundle secret is missing",
                    )),
                    CertificateManagerKind::Archon => {
                        let ca = CertificateAuthority::new(CA_COMMON_NAME)?;
                        self.store.save(ca.ca_cert_pem(), ca.ca_key_pem()).await?;
                        info!("generated mesh CA");
                        Ok(ca)
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl CertManager for ArchonCertManager {
    async fn issue_certificate(
        &self,
        common_name: &str,
        ttl: Duration,
        dns_names: &[String],
    ) -> Result<IssuedCertificate> {
        let ca = self.authority().await?;
        Ok(ca.issue(common_name, ttl, dns_names)?)
    }

    async fn ca_bundle(&self) -> Result<String> {
        Ok(self.authority().await?.ca_cert_pem().to_string())
    }
}
