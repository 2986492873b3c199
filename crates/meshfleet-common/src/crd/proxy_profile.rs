//! ProxyProfile CRD: sidecar injection policy

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{kube_utils, Result, CONFIG_HASH_ANNOTATION, SPEC_HASH_ANNOTATION};

/// ProxyProfile selects pods for sidecar injection and describes the sidecars.
///
/// In `Local` mode the sidecar scripts come from `config`, rendered into a
/// ConfigMap per injected namespace. In `Remote` mode sidecars pull their
/// scripts from a codebase derived from `parentCodebasePath`.
///
/// Example:
/// ```yaml
/// apiVersion: meshfleet.io/v1alpha1
/// kind: ProxyProfile
/// metadata:
///   name: shop-proxy
/// spec:
///   namespace: shop
///   selector:
///     matchLabels:
///       app: cart
///   mode: Remote
///   restartPolicy: Always
///   restartScope: Owner
///   sidecars:
///     - name: proxy
///       parentCodebasePath: /base/sidecars/default
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "meshfleet.io",
    derive = "PartialEq",
    version = "v1alpha1",
    kind = "ProxyProfile",
    status = "ProxyProfileStatus",
    shortname = "pf",
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.namespace"}"#,
    printcolumn = r#"{"name":"Disabled","type":"boolean","jsonPath":".spec.disabled"}"#,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProxyProfileSpec {
    /// Disabled profiles never match
    #[serde(default)]
    pub disabled: bool,

    /// Restrict matching to pods of this namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Pods matched by this selector are injected; empty matches nothing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Where sidecar scripts come from
    #[serde(default)]
    pub mode: ProxyMode,

    /// Inline scripts for `Local` mode, filename to content
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    /// Repo base URL sidecars fetch their codebase from (`Remote` mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_base_url: Option<String>,

    /// Default parent codebase for sidecars (`Remote` mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_codebase_path: Option<String>,

    /// Env appended to every application container of injected pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_env: Vec<EnvVar>,

    /// Whether pods are restarted when the profile changes
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// What gets restarted when `restartPolicy` is `Always`
    #[serde(default)]
    pub restart_scope: RestartScope,

    /// Sidecar containers to inject
    #[serde(default)]
    pub sidecars: Vec<Sidecar>,
}

/// Sidecar container description
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    /// Container name
    pub name: String,

    /// Container image; defaults to the mesh proxy image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image pull policy; defaults by image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Container command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Container args
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Container env
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Script started by the proxy (`Local` mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_script_name: Option<String>,

    /// Parent codebase of this sidecar's codebase (`Remote` mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_codebase_path: Option<String>,

    /// Codebase the sidecar loads (`Remote` mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codebase_path: Option<String>,
}

/// Script source for sidecars
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProxyMode {
    /// Scripts inlined in the profile and mounted from a ConfigMap
    Local,
    /// Scripts fetched from the codebase repo
    #[default]
    Remote,
}

/// Restart behaviour on profile change
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart; changes apply to new pods only
    #[default]
    Never,
    /// Restart affected workloads
    Always,
}

/// Unit of restart
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestartScope {
    /// Delete injected pods
    Pod,
    /// Restart only the sidecar containers
    Sidecar,
    /// Roll out the owning workload
    #[default]
    Owner,
}

/// ProxyProfile status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyProfileStatus {
    /// Spec hash of the last change acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_spec_hash: Option<String>,

    /// Namespace to ConfigMap name, `Local` mode
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_maps: BTreeMap<String, String>,
}

impl ProxyProfileSpec {
    /// Hash over the inline scripts
    pub fn config_hash(&self) -> Result<String> {
        kube_utils::hash_value(&self.config)
    }

    /// Hash over the whole spec
    pub fn spec_hash(&self) -> Result<String> {
        kube_utils::hash_value(self)
    }
}

impl ProxyProfile {
    /// Config hash recorded by the defaulter
    pub fn config_hash_annotation(&self) -> Option<&str> {
        self.annotations()
            .get(CONFIG_HASH_ANNOTATION)
            .map(String::as_str)
    }

    /// Spec hash recorded by the defaulter
    pub fn spec_hash_annotation(&self) -> Option<&str> {
        self.annotations().get(SPEC_HASH_ANNOTATION).map(String::as_str)
    }

    /// Name of the ConfigMap holding `Local` mode scripts
    pub fn config_map_name(&self) -> String {
        format!("proxy-profile-{}", self.name_any())
    }

    /// Codebase of a sidecar in `Remote` mode
    pub fn sidecar_codebase_path(&self, sidecar: &Sidecar) -> String {
        sidecar
            .codebase_path
            .clone()
            .unwrap_or_else(|| format!("/local/sidecars/{}/{}", self.name_any(), sidecar.name))
    }
}
