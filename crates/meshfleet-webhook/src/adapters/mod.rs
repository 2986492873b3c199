//! Defaulters and validators of every admitted resource

pub mod cluster;
pub mod global_traffic_policy;
pub mod ingress;
pub mod namespaced_ingress;
pub mod proxy_profile;
pub mod service_export;
pub mod service_import;

use std::sync::Arc;

use k8s_openapi::api::networking::v1::Ingress;
use meshfleet_common::crd::{
    Cluster, GlobalTrafficPolicy, NamespacedIngress, ProxyProfile, ServiceExport, ServiceImport,
};
use meshfleet_config::MeshConfigStore;

use crate::adapter::{MutatingAdapter, ValidatingAdapter};
use crate::injector::SidecarInjector;
use crate::lookup::AdmissionLookup;
use crate::registry::{AdmissionOperation, RuleScope, WebhookRegistry, WebhookRule};

use AdmissionOperation::{Create, Update};

/// Path the pod injector is served at
pub const POD_INJECTOR_PATH: &str = "/mutate-v1-pod";

fn mutate_path(resource: &str) -> String {
    format!("/mutate-meshfleet-io-v1alpha1-{resource}")
}

fn validate_path(resource: &str) -> String {
    format!("/validate-meshfleet-io-v1alpha1-{resource}")
}

fn rule(resource: &str, scope: RuleScope) -> WebhookRule {
    WebhookRule::meshfleet(resource, &[Create, Update], scope)
}

/// Registry with every admission handler mounted
pub fn registry(lookup: Arc<dyn AdmissionLookup>, store: Arc<MeshConfigStore>) -> WebhookRegistry {
    let mut r = WebhookRegistry::new();

    r.register(
        mutate_path("cluster"),
        Arc::new(MutatingAdapter::<Cluster>::new(
            rule("clusters", RuleScope::Cluster),
            Arc::new(cluster::ClusterDefaulter),
        )),
    );
    r.register(
        validate_path("cluster"),
        Arc::new(ValidatingAdapter::<Cluster>::new(
            rule("clusters", RuleScope::Cluster),
            Arc::new(cluster::ClusterValidator::new(lookup.clone())),
        )),
    );

    r.register(
        mutate_path("proxyprofile"),
        Arc::new(MutatingAdapter::<ProxyProfile>::new(
            rule("proxyprofiles", RuleScope::Cluster),
            Arc::new(proxy_profile::ProxyProfileDefaulter::new(store.clone())),
        )),
    );
    r.register(
        validate_path("proxyprofile"),
        Arc::new(ValidatingAdapter::<ProxyProfile>::new(
            rule("proxyprofiles", RuleScope::Cluster),
            Arc::new(proxy_profile::ProxyProfileValidator),
        )),
    );

    r.register(
        mutate_path("serviceexport"),
        Arc::new(MutatingAdapter::<ServiceExport>::new(
            rule("serviceexports", RuleScope::Namespaced),
            Arc::new(service_export::ServiceExportDefaulter),
        )),
    );
    r.register(
        validate_path("serviceexport"),
        Arc::new(ValidatingAdapter::<ServiceExport>::new(
            rule("serviceexports", RuleScope::Namespaced),
            Arc::new(service_export::ServiceExportValidator),
        )),
    );

    r.register(
        validate_path("serviceimport"),
        Arc::new(ValidatingAdapter::<ServiceImport>::new(
            rule("serviceimports", RuleScope::Namespaced),
            Arc::new(service_import::ServiceImportValidator),
        )),
    );

    r.register(
        mutate_path("namespacedingress"),
        Arc::new(MutatingAdapter::<NamespacedIngress>::new(
            rule("namespacedingresses", RuleScope::Namespaced),
            Arc::new(namespaced_ingress::NamespacedIngressDefaulter),
        )),
    );
    r.register(
        validate_path("namespacedingress"),
        Arc::new(ValidatingAdapter::<NamespacedIngress>::new(
            rule("namespacedingresses", RuleScope::Namespaced),
            Arc::new(namespaced_ingress::NamespacedIngressValidator::new(
                lookup.clone(),
            )),
        )),
    );

    r.register(
        mutate_path("globaltrafficpolicy"),
        Arc::new(MutatingAdapter::<GlobalTrafficPolicy>::new(
            rule("globaltrafficpolicies", RuleScope::Namespaced),
            Arc::new(global_traffic_policy::GlobalTrafficPolicyDefaulter),
        )),
    );
    r.register(
        validate_path("globaltrafficpolicy"),
        Arc::new(ValidatingAdapter::<GlobalTrafficPolicy>::new(
            rule("globaltrafficpolicies", RuleScope::Namespaced),
            Arc::new(global_traffic_policy::GlobalTrafficPolicyValidator),
        )),
    );

    r.register(
        "/validate-networking-v1-ingress",
        Arc::new(ValidatingAdapter::<Ingress>::new(
            WebhookRule::new(
                "networking.k8s.io",
                "v1",
                "ingresses",
                &[Create, Update],
                RuleScope::Namespaced,
            ),
            Arc::new(ingress::IngressValidator::new(lookup.clone())),
        )),
    );

    r.register(
        POD_INJECTOR_PATH,
        Arc::new(SidecarInjector::new(lookup, store)),
    );

    r
}
