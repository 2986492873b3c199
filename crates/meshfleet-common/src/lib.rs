//! Common types for meshfleet: CRDs, the mesh config document, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod mesh_config;
pub mod pki;
pub mod retry;
pub mod selector;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of every meshfleet CRD
pub const API_GROUP: &str = "meshfleet.io";

/// API version of every meshfleet CRD
pub const API_VERSION: &str = "v1alpha1";

/// Default namespace for meshfleet system resources
pub const MESH_NAMESPACE: &str = "meshfleet-system";

/// Reserved name of the single InCluster Cluster
pub const LOCAL_CLUSTER_NAME: &str = "local";

/// Name of the ConfigMap holding the mesh config document
pub const MESH_CONFIG_NAME: &str = "meshfleet-mesh-config";

/// Key of the mesh config JSON document inside its ConfigMap
pub const MESH_CONFIG_KEY: &str = "mesh_config.json";

/// Label/annotation enabling sidecar injection on namespaces and pods
pub const INJECT_KEY: &str = "meshfleet.io/inject";

/// Annotation recording that a pod has been injected
pub const INJECT_STATUS_ANNOTATION: &str = "meshfleet.io/inject-status";

/// Value of [`INJECT_STATUS_ANNOTATION`] once injected
pub const INJECT_STATUS_INJECTED: &str = "injected";

/// Label naming the ProxyProfile a pod or ConfigMap belongs to
pub const PROXY_PROFILE_LABEL: &str = "meshfleet.io/proxy-profile";

/// Label marking the default ProxyProfile used when several match
pub const PROXY_PROFILE_DEFAULT_LABEL: &str = "meshfleet.io/default-proxy-profile";

/// Annotation with the hash of a ProxyProfile's inline config
pub const CONFIG_HASH_ANNOTATION: &str = "meshfleet.io/config-hash";

/// Annotation with the hash of a ProxyProfile's spec
pub const SPEC_HASH_ANNOTATION: &str = "meshfleet.io/spec-hash";

/// Pod template annotation stamped to trigger a rollout
pub const RESTARTED_AT_ANNOTATION: &str = "meshfleet.io/restartedAt";

/// Ingress class handled by the mesh ingress
pub const MESH_INGRESS_CLASS: &str = "meshfleet";

/// Label shared by every workload the control plane deploys
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// Value of [`PART_OF_LABEL`] on meshfleet workloads
pub const PART_OF_VALUE: &str = "meshfleet";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "meshfleet-controller";

/// Base codebase of the ingress pipeline
pub const INGRESS_BASE_PATH: &str = "/base/ingress";

/// Base codebase of the services pipeline
pub const SERVICES_BASE_PATH: &str = "/base/services";

/// Base codebase of the gateways pipeline
pub const GATEWAYS_BASE_PATH: &str = "/base/gateways";

/// Name of the ingress controller Deployment and Service
pub const INGRESS_CONTROLLER_NAME: &str = "meshfleet-ingress";
