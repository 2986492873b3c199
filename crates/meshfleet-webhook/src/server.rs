//! HTTPS server dispatching admission reviews through the registry

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::Uri,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use meshfleet_common::pki::service_dns_names;
use meshfleet_config::cert::DEFAULT_CERT_TTL;
use meshfleet_config::CertManager;

use crate::error::WebhookError;
use crate::registry::WebhookRegistry;

/// Default HTTPS port of the webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// How long in-flight reviews may finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Where and as whom the webhook server listens
#[derive(Clone, Debug)]
pub struct WebhookServerConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// Service the API server calls; names the serving certificate
    pub service_name: String,
    /// Namespace of that Service
    pub namespace: String,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn admit(
    State(registry): State<Arc<WebhookRegistry>>,
    uri: Uri,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let handler = registry
        .get(uri.path())
        .ok_or_else(|| WebhookError::UnknownPath(uri.path().to_string()))?;

    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, path = %uri.path(), "failed to parse admission request");
            return Ok(Json(AdmissionResponse::invalid(e.to_string()).into_review()));
        }
    };

    let response = handler.admit(&request).await;
    Ok(Json(response.into_review()))
}

/// Create the webhook router: one POST route per registered path plus
/// `/healthz`
pub fn webhook_router(registry: Arc<WebhookRegistry>) -> Router {
    let mut router = Router::new().route("/healthz", get(healthz));
    for path in registry.paths() {
        router = router.route(path, post(admit));
    }
    router.with_state(registry)
}

/// Serve `registry` over TLS until `cancel` fires
///
/// The serving certificate is issued by `certs` for the webhook Service.
pub async fn serve(
    registry: Arc<WebhookRegistry>,
    certs: Arc<dyn CertManager>,
    config: WebhookServerConfig,
    cancel: CancellationToken,
) -> Result<(), WebhookError> {
    let dns_names = service_dns_names(&config.service_name, &config.namespace);
    let cert = certs
        .issue_certificate(&config.service_name, DEFAULT_CERT_TTL, &dns_names)
        .await
        .map_err(|e| WebhookError::Server(format!("issuing serving certificate: {e}")))?;

    let tls = RustlsConfig::from_pem(cert.cert_pem.into_bytes(), cert.key_pem.into_bytes())
        .await
        .map_err(|e| WebhookError::Server(format!("TLS config error: {e}")))?;

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(addr = %config.addr, "starting admission webhook server");
    axum_server::bind_rustls(config.addr, tls)
        .handle(handle)
        .serve(webhook_router(registry).into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdmissionHandler;
    use crate::registry::{AdmissionOperation, RuleScope, WebhookKind, WebhookRule};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn registry(allowed: bool) -> Arc<WebhookRegistry> {
        let mut handler = MockAdmissionHandler::new();
        handler.expect_kind().return_const(WebhookKind::Validating);
        handler.expect_rule().return_const(WebhookRule::meshfleet(
            "clusters",
            &[AdmissionOperation::Create],
            RuleScope::Cluster,
        ));
        handler.expect_admit().returning(move |req| {
            let response = AdmissionResponse::from(req);
            if allowed {
                response
            } else {
                response.deny("nope")
            }
        });

        let mut registry = WebhookRegistry::new();
        registry.register("/validate-cluster", Arc::new(handler));
        Arc::new(registry)
    }

    fn review_body() -> String {
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "6c4b0d53-3ef6-4bd1-9e2c-0d1d1c0a8c01",
                "kind": { "group": "meshfleet.io", "version": "v1alpha1", "kind": "Cluster" },
                "resource": { "group": "meshfleet.io", "version": "v1alpha1", "resource": "clusters" },
                "operation": "CREATE",
                "name": "local",
                "userInfo": { "username": "admin" },
                "object": {
                    "apiVersion": "meshfleet.io/v1alpha1",
                    "kind": "Cluster",
                    "metadata": { "name": "local" },
                    "spec": {}
                }
            }
        })
        .to_string()
    }

    async fn post(router: Router, path: &str, body: String) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn review_is_dispatched_by_path() {
        let (status, body) = post(webhook_router(registry(false)), "/validate-cluster", review_body()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["allowed"], false);
        assert_eq!(body["response"]["uid"], "6c4b0d53-3ef6-4bd1-9e2c-0d1d1c0a8c01");
        assert_eq!(body["response"]["status"]["message"], "nope");
    }

    #[tokio::test]
    async fn allowed_review_round_trips() {
        let (status, body) = post(webhook_router(registry(true)), "/validate-cluster", review_body()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["allowed"], true);
    }

    #[tokio::test]
    async fn review_without_request_is_invalid() {
        let body = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview"
        })
        .to_string();
        let (status, body) = post(webhook_router(registry(true)), "/validate-cluster", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["allowed"], false);
    }

    #[tokio::test]
    async fn unknown_path_is_not_routed() {
        let (status, _) = post(webhook_router(registry(true)), "/mutate-pod", review_body()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn healthz_answers() {
        let response = webhook_router(registry(true))
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
