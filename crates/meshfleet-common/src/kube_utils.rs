//! Shared Kubernetes utilities using kube-rs

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde::Serialize;
use tracing::trace;

use crate::Error;

/// Trait for types that have a known API group, version, and kind.
///
/// Used for the Gateway API types the gateway reconciler reads as
/// handwritten structs instead of generated CRDs.
pub trait HasApiResource {
    /// Full API version (e.g., "gateway.networking.k8s.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "HTTPRoute")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion string and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split "group/version" into its parts; core types have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with("ss") || lower.ends_with("sh") || lower.ends_with("ch") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else if lower.ends_with('s') {
        lower
    } else {
        format!("{}s", lower)
    }
}

/// Poll until a condition is met or the timeout elapses.
///
/// `check_fn` returns `Ok(true)` when done, `Ok(false)` to keep polling.
/// Errors from the check are logged at trace level and polling continues.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!("Polling check returned error (retrying): {}", e),
        }

        if start.elapsed() + poll_interval > timeout {
            return Err(Error::transient("poll_until", timeout_msg));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path, else the ambient config.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            client_from_kubeconfig(kubeconfig).await
        }
        None => {
            let mut config = Config::infer().await.map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to infer config: {}", e),
                )
            })?;
            config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
            config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
            Client::try_from(config).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to create client: {}", e),
                )
            })
        }
    }
}

/// Create a kube client from a parsed kubeconfig.
pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client, Error> {
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Patch the status sub-resource of a namespaced resource via merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Patch the status sub-resource of a cluster-scoped resource via merge-patch.
pub async fn patch_cluster_resource_status<T>(
    client: &Client,
    name: &str,
    status: &impl Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::all(client.clone());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so persisted hashes (annotations, status fields,
/// supervisor spec hashes) stay stable across toolchain versions.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Hash any serializable value through its JSON form.
///
/// `serde_json::Value` keeps object keys sorted, so maps hash the same
/// regardless of insertion order.
pub fn hash_value<T: Serialize>(value: &T) -> Result<String, Error> {
    let canonical = serde_json::to_value(value)?;
    Ok(deterministic_hash(&canonical.to_string()))
}

/// Merge patch stamping the rollout annotation on a workload's pod template.
pub fn restart_patch(now: DateTime<Utc>) -> serde_json::Value {
    let mut annotations = serde_json::Map::new();
    annotations.insert(
        crate::RESTARTED_AT_ANNOTATION.to_string(),
        serde_json::Value::String(now.to_rfc3339()),
    );
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": { "annotations": annotations }
            }
        }
    })
}

/// True when a kube error is an API 404.
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Translate a kube `get` result into an `Option`, mapping 404 to `None`.
pub fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if is_kube_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_from_constants() {
        struct HttpRouteMarker;
        impl HasApiResource for HttpRouteMarker {
            const API_VERSION: &'static str = "gateway.networking.k8s.io/v1";
            const KIND: &'static str = "HTTPRoute";
        }
        let ar = HttpRouteMarker::api_resource();
        assert_eq!(ar.group, "gateway.networking.k8s.io");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "httproutes");
    }

    #[test]
    fn core_api_versions_have_empty_group() {
        assert_eq!(
            parse_api_version("v1"),
            (String::new(), "v1".to_string())
        );
    }

    #[test]
    fn pluralization_handles_common_suffixes() {
        assert_eq!(pluralize_kind("Gateway"), "gateways");
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("GlobalTrafficPolicy"), "globaltrafficpolicies");
        assert_eq!(pluralize_kind("Endpoints"), "endpoints");
    }

    #[test]
    fn deterministic_hash_is_stable_and_short() {
        let a = deterministic_hash("east-gateway:8080");
        assert_eq!(a, deterministic_hash("east-gateway:8080"));
        assert_ne!(a, deterministic_hash("west-gateway:8080"));
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn value_hash_ignores_map_insertion_order() {
        let mut a = std::collections::HashMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        let mut b = std::collections::HashMap::new();
        b.insert("a", 1);
        b.insert("b", 2);
        assert_eq!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn restart_patch_targets_pod_template() {
        let now = Utc::now();
        let patch = restart_patch(now);
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][crate::RESTARTED_AT_ANNOTATION],
            serde_json::json!(now.to_rfc3339())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out() {
        let result = poll_until(
            Duration::from_secs(3),
            Duration::from_secs(1),
            "never ready",
            || async { Ok(false) },
        )
        .await;
        assert!(matches!(result, Err(Error::Transient { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_returns_when_ready() {
        let mut calls = 0;
        let result = poll_until(
            Duration::from_secs(30),
            Duration::from_secs(5),
            "ready",
            || {
                calls += 1;
                let done = calls >= 3;
                async move { Ok(done) }
            },
        )
        .await;
        assert!(result.is_ok());
    }
}
