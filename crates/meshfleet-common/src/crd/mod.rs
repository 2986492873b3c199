//! Custom Resource Definitions for meshfleet
//!
//! All CRDs live in the `meshfleet.io/v1alpha1` API group.

mod cluster;
mod global_traffic_policy;
mod namespaced_ingress;
mod proxy_profile;
mod service_export;
mod service_import;
mod types;

pub use cluster::{Cluster, ClusterKey, ClusterMode, ClusterSpec, ClusterStatus};
pub use global_traffic_policy::{
    GlobalTrafficPolicy, GlobalTrafficPolicySpec, LoadBalancerMode, TrafficTarget,
};
pub use namespaced_ingress::{
    HttpListener, NamespacedIngress, NamespacedIngressSpec, NamespacedIngressStatus,
    SslPassthrough, TlsListener,
};
pub use proxy_profile::{
    ProxyMode, ProxyProfile, ProxyProfileSpec, ProxyProfileStatus, RestartPolicy, RestartScope,
    Sidecar,
};
pub use service_export::{
    LoadBalancerType, PathRewrite, ServiceExport, ServiceExportRule, ServiceExportSpec,
    ServiceExportStatus,
};
pub use service_import::{Endpoint, ServiceImport, ServiceImportSpec, ServicePort};
pub use types::{
    condition_is, condition_types, find_condition, set_condition, Condition, ConditionStatus,
};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

/// Every CRD the control plane installs
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Cluster::crd(),
        ProxyProfile::crd(),
        ServiceExport::crd(),
        ServiceImport::crd(),
        NamespacedIngress::crd(),
        GlobalTrafficPolicy::crd(),
    ]
}
