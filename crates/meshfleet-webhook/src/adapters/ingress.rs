//! Validation of Ingresses served by the mesh ingress controller

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use meshfleet_common::{Error, Result, MESH_INGRESS_CLASS};

use crate::adapter::Validator;
use crate::lookup::AdmissionLookup;

/// Legacy ingress class annotation
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
/// Secret holding the client certificate presented to upstreams
pub const UPSTREAM_SSL_SECRET_ANNOTATION: &str = "meshfleet.io/upstream-ssl-secret";
/// Secret holding the CA used to verify clients
pub const TRUSTED_CA_SECRET_ANNOTATION: &str = "meshfleet.io/tls-trusted-ca-secret";

/// True when the Ingress belongs to the mesh ingress controller
pub fn is_mesh_ingress(ingress: &Ingress) -> bool {
    let by_class = ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref())
        == Some(MESH_INGRESS_CLASS);
    let by_annotation = ingress
        .annotations()
        .get(INGRESS_CLASS_ANNOTATION)
        .map(String::as_str)
        == Some(MESH_INGRESS_CLASS);
    by_class || by_annotation
}

/// Rejects mesh Ingresses that reference missing Secrets
pub struct IngressValidator {
    lookup: Arc<dyn AdmissionLookup>,
}

impl IngressValidator {
    /// Validator checking Secrets through `lookup`
    pub fn new(lookup: Arc<dyn AdmissionLookup>) -> Self {
        Self { lookup }
    }

    async fn require_secret(&self, ingress: &Ingress, reference: &str, source: &str) -> Result<()> {
        let own_namespace = ingress.namespace().unwrap_or_default();
        let (namespace, name) = reference
            .split_once('/')
            .unwrap_or((own_namespace.as_str(), reference));
        if self.lookup.secret_exists(namespace, name).await? {
            return Ok(());
        }
        Err(Error::validation_for(
            "Ingress",
            format!(
                "secret {namespace}/{name} referenced by {source} of Ingress {own_namespace}/{} does not exist",
                ingress.name_any()
            ),
        ))
    }

    async fn check(&self, ingress: &Ingress) -> Result<()> {
        if !is_mesh_ingress(ingress) {
            return Ok(());
        }

        for annotation in [UPSTREAM_SSL_SECRET_ANNOTATION, TRUSTED_CA_SECRET_ANNOTATION] {
            if let Some(secret) = ingress.annotations().get(annotation).filter(|s| !s.is_empty()) {
                self.require_secret(ingress, secret, &format!("annotation {annotation}"))
                    .await?;
            }
        }

        let tls = ingress.spec.as_ref().and_then(|s| s.tls.as_ref());
        for secret in tls.into_iter().flatten().filter_map(|t| t.secret_name.as_deref()) {
            if !secret.is_empty() {
                self.require_secret(ingress, secret, "spec.tls").await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Validator<Ingress> for IngressValidator {
    async fn validate_create(&self, obj: &Ingress) -> Result<()> {
        self.check(obj).await
    }

    async fn validate_update(&self, _old: &Ingress, new: &Ingress) -> Result<()> {
        self.check(new).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::MockAdmissionLookup;
    use k8s_openapi::api::networking::v1::{IngressSpec, IngressTLS};
    use mockall::predicate::eq;

    fn ingress(class: Option<&str>, tls_secret: Option<&str>) -> Ingress {
        let mut ing = Ingress {
            spec: Some(IngressSpec {
                ingress_class_name: class.map(str::to_string),
                tls: tls_secret.map(|s| {
                    vec![IngressTLS {
                        secret_name: Some(s.to_string()),
                        hosts: None,
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        ing.metadata.name = Some("shop".to_string());
        ing.metadata.namespace = Some("shop".to_string());
        ing
    }

    #[tokio::test]
    async fn foreign_ingress_class_is_ignored() {
        let mut lookup = MockAdmissionLookup::new();
        lookup.expect_secret_exists().never();
        let v = IngressValidator::new(Arc::new(lookup));
        assert!(v
            .validate_create(&ingress(Some("nginx"), Some("missing")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn missing_tls_secret_is_rejected() {
        let mut lookup = MockAdmissionLookup::new();
        lookup
            .expect_secret_exists()
            .with(eq("shop"), eq("shop-tls"))
            .returning(|_, _| Ok(false));
        let v = IngressValidator::new(Arc::new(lookup));

        let err = v
            .validate_create(&ingress(Some(MESH_INGRESS_CLASS), Some("shop-tls")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("shop/shop-tls"));
    }

    #[tokio::test]
    async fn annotation_secret_may_name_another_namespace() {
        let mut lookup = MockAdmissionLookup::new();
        lookup
            .expect_secret_exists()
            .with(eq("certs"), eq("upstream"))
            .times(1)
            .returning(|_, _| Ok(true));
        let v = IngressValidator::new(Arc::new(lookup));

        let mut ing = ingress(None, None);
        ing.annotations_mut()
            .insert(INGRESS_CLASS_ANNOTATION.to_string(), MESH_INGRESS_CLASS.to_string());
        ing.annotations_mut().insert(
            UPSTREAM_SSL_SECRET_ANNOTATION.to_string(),
            "certs/upstream".to_string(),
        );
        assert!(v.validate_create(&ing).await.is_ok());
    }
}
