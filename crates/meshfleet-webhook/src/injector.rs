//! Sidecar injection for pods
//!
//! A pod is injected when it opts in, or when its namespace opts in and the
//! pod does not opt out. The ProxyProfile whose selector matches the pod
//! decides the sidecars. In `Local` mode the sidecar scripts are copied from
//! the profile ConfigMap into a shared volume; in `Remote` mode an init
//! container derives the sidecar codebases and the sidecars load them from
//! the repo.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, Pod, Volume, VolumeMount,
};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use meshfleet_common::crd::{ProxyMode, ProxyProfile, Sidecar};
use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{
    selector, Error, Result, INJECT_KEY, INJECT_STATUS_ANNOTATION, INJECT_STATUS_INJECTED,
    PROXY_PROFILE_DEFAULT_LABEL, PROXY_PROFILE_LABEL,
};
use meshfleet_config::MeshConfigStore;

use crate::adapter::{patch_response, AdmissionHandler};
use crate::adapters::proxy_profile::image_pull_policy_by_tag;
use crate::lookup::AdmissionLookup;
use crate::registry::{AdmissionOperation, RuleScope, WebhookKind, WebhookRule};

/// Volume shared by the init container and the sidecars
pub const SHARED_VOLUME: &str = "meshfleet-proxy-shared";
/// Mount path of [`SHARED_VOLUME`]
pub const SHARED_MOUNT_PATH: &str = "/var/run/meshfleet";
/// Mount path of the profile ConfigMap in `Local` mode
pub const CONFIG_MOUNT_PATH: &str = "/etc/meshfleet/config";
/// Name of the injected init container
pub const INIT_CONTAINER_NAME: &str = "meshfleet-init";
/// Env var naming the script or URL a sidecar starts from
pub const PROXY_CONFIG_FILE_ENV: &str = "PROXY_CONFIG_FILE";
/// Env var listing `parent,child` codebase pairs for the init container
pub const CODEBASE_PATHS_ENV: &str = "PROXY_CODEBASE_PATHS";
/// Env var with the repo base URL
pub const REPO_BASE_URL_ENV: &str = "PROXY_REPO_BASE_URL";
/// Env var with the repo API URL
pub const REPO_API_BASE_URL_ENV: &str = "PROXY_REPO_API_BASE_URL";

/// Controller kinds whose pods are injected
const INJECTABLE_OWNERS: &[&str] = &[
    "Deployment",
    "DaemonSet",
    "ReplicationController",
    "ReplicaSet",
    "StatefulSet",
    "Pod",
];

const LOCAL_INIT_SCRIPT: &str = "cp -rL /etc/meshfleet/config/. /var/run/meshfleet/";

const REMOTE_INIT_SCRIPT: &str = r#"set -e
for pair in $PROXY_CODEBASE_PATHS; do
  parent="${pair%%,*}"
  child="${pair#*,}"
  if curl -sf -o /dev/null "$PROXY_REPO_API_BASE_URL$child"; then
    continue
  fi
  if [ -n "$parent" ]; then
    body="{\"version\":1,\"base\":\"$parent\"}"
  else
    body="{\"version\":1}"
  fi
  curl -sf -X POST -d "$body" "$PROXY_REPO_API_BASE_URL$child"
  curl -sf -X POST -d '{"version":2}' "$PROXY_REPO_API_BASE_URL$child"
done
"#;

/// Reason a pod is left untouched
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Skip {
    /// Pod shares the node network
    HostNetwork,
    /// Pod is owned by a controller kind that is not injected
    Owner(String),
    /// Pod already carries the sidecars
    AlreadyInjected,
    /// Neither the pod nor its namespace asks for injection
    NotRequested,
}

/// Decide whether `pod` in a namespace labelled `namespace_labels` gets
/// sidecars
pub fn injection_decision(
    pod: &Pod,
    namespace_labels: &BTreeMap<String, String>,
) -> std::result::Result<(), Skip> {
    if pod
        .spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false)
    {
        return Err(Skip::HostNetwork);
    }

    let controller = pod
        .owner_references()
        .iter()
        .find(|o| o.controller.unwrap_or(false));
    if let Some(owner) = controller {
        if !INJECTABLE_OWNERS.contains(&owner.kind.as_str()) {
            return Err(Skip::Owner(owner.kind.clone()));
        }
    }

    if pod.annotations().get(INJECT_STATUS_ANNOTATION).map(String::as_str)
        == Some(INJECT_STATUS_INJECTED)
    {
        return Err(Skip::AlreadyInjected);
    }

    match pod.annotations().get(INJECT_KEY).map(String::as_str) {
        Some("true") => Ok(()),
        Some("false") => Err(Skip::NotRequested),
        _ if namespace_labels.get(INJECT_KEY).map(String::as_str) == Some("true") => Ok(()),
        _ => Err(Skip::NotRequested),
    }
}

/// Pick the profile for a pod: the single enabled profile whose namespace and
/// selector match, or the one marked default among several matches
pub fn select_profile<'a>(
    profiles: &'a [ProxyProfile],
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Result<Option<&'a ProxyProfile>> {
    let matched: Vec<&ProxyProfile> = profiles
        .iter()
        .filter(|p| !p.spec.disabled)
        .filter(|p| p.spec.namespace.as_deref().is_none_or(|ns| ns == namespace))
        .filter(|p| selector::matches(p.spec.selector.as_ref(), labels))
        .collect();

    match matched.as_slice() {
        [] => Ok(None),
        [only] => Ok(Some(*only)),
        several => {
            let defaults: Vec<&&ProxyProfile> = several
                .iter()
                .filter(|p| {
                    p.labels().get(PROXY_PROFILE_DEFAULT_LABEL).map(String::as_str) == Some("true")
                })
                .collect();
            match defaults.as_slice() {
                [default] => Ok(Some(**default)),
                _ => Err(Error::validation_for(
                    "ProxyProfile",
                    format!(
                        "{} ProxyProfiles match the pod and {} of them are labelled {}=true, exactly one must be",
                        several.len(),
                        defaults.len(),
                        PROXY_PROFILE_DEFAULT_LABEL
                    ),
                )),
            }
        }
    }
}

/// Values substituted into codebase path templates
struct PathVars<'a> {
    config: &'a MeshConfig,
    namespace: &'a str,
    service: &'a str,
}

impl PathVars<'_> {
    fn render(&self, template: &str) -> String {
        let cluster = &self.config.cluster;
        template
            .replace("{region}", &cluster.region)
            .replace("{zone}", &cluster.zone)
            .replace("{group}", &cluster.group)
            .replace("{cluster}", &cluster.name)
            .replace("{namespace}", self.namespace)
            .replace("{service}", self.service)
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn shared_mount() -> VolumeMount {
    VolumeMount {
        name: SHARED_VOLUME.to_string(),
        mount_path: SHARED_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

fn config_volume_name(profile: &ProxyProfile) -> String {
    format!("{}-config", profile.name_any())
}

/// Containers, volumes and env a profile adds to a pod
#[derive(Debug, Default)]
pub struct SidecarTemplate {
    /// Sidecars, prepended to the pod containers
    pub containers: Vec<Container>,
    /// Init containers, appended
    pub init_containers: Vec<Container>,
    /// Volumes, appended
    pub volumes: Vec<Volume>,
    /// Env appended to every application container
    pub service_env: Vec<EnvVar>,
}

/// Render the sidecars of `profile` for a pod in `namespace` backing `service`
pub fn sidecar_template(
    profile: &ProxyProfile,
    config: &MeshConfig,
    namespace: &str,
    service: &str,
) -> SidecarTemplate {
    let vars = PathVars {
        config,
        namespace,
        service,
    };
    let repo_base_url = profile
        .spec
        .repo_base_url
        .clone()
        .unwrap_or_else(|| config.repo_base_url());

    let mut template = SidecarTemplate {
        volumes: vec![Volume {
            name: SHARED_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }],
        service_env: profile.spec.service_env.clone(),
        ..Default::default()
    };

    let mut codebase_pairs = Vec::new();
    for sidecar in &profile.spec.sidecars {
        let config_file = match profile.spec.mode {
            ProxyMode::Local => {
                let script = sidecar
                    .startup_script_name
                    .clone()
                    .unwrap_or_else(|| format!("{}.js", sidecar.name));
                format!("{SHARED_MOUNT_PATH}/{script}")
            }
            ProxyMode::Remote => {
                let parent = sidecar
                    .parent_codebase_path
                    .as_deref()
                    .or(profile.spec.parent_codebase_path.as_deref())
                    .map(|p| vars.render(p))
                    .unwrap_or_default();
                let codebase = vars.render(&profile.sidecar_codebase_path(sidecar));
                codebase_pairs.push(format!(
                    "{},{}",
                    parent.trim_end_matches('/'),
                    codebase.trim_end_matches('/')
                ));
                format!("{repo_base_url}{codebase}")
            }
        };
        template
            .containers
            .push(sidecar_container(sidecar, config, config_file));
    }

    let init_image = config.proxy_init_image();
    let mut init = Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image_pull_policy: Some(image_pull_policy_by_tag(&init_image).to_string()),
        image: Some(init_image),
        volume_mounts: Some(vec![shared_mount()]),
        ..Default::default()
    };
    match profile.spec.mode {
        ProxyMode::Local => {
            let volume_name = config_volume_name(profile);
            template.volumes.push(Volume {
                name: volume_name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: profile.config_map_name(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            init.command = Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                LOCAL_INIT_SCRIPT.to_string(),
            ]);
            if let Some(mounts) = init.volume_mounts.as_mut() {
                mounts.push(VolumeMount {
                    name: volume_name,
                    mount_path: CONFIG_MOUNT_PATH.to_string(),
                    ..Default::default()
                });
            }
        }
        ProxyMode::Remote => {
            init.env = Some(vec![
                env(CODEBASE_PATHS_ENV, codebase_pairs.join(" ")),
                env(REPO_BASE_URL_ENV, repo_base_url),
                env(REPO_API_BASE_URL_ENV, config.repo_api_base_url()),
            ]);
            init.command = Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                REMOTE_INIT_SCRIPT.to_string(),
            ]);
        }
    }
    template.init_containers.push(init);
    template
}

fn sidecar_container(sidecar: &Sidecar, config: &MeshConfig, config_file: String) -> Container {
    let image = sidecar.image.clone().unwrap_or_else(|| config.proxy_image());
    let pull_policy = sidecar
        .image_pull_policy
        .clone()
        .unwrap_or_else(|| image_pull_policy_by_tag(&image).to_string());

    let mut env_vars = sidecar.env.clone();
    env_vars.push(env(PROXY_CONFIG_FILE_ENV, config_file));

    let (command, args) = if sidecar.command.is_empty() && sidecar.args.is_empty() {
        (
            Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("pipy $({PROXY_CONFIG_FILE_ENV})"),
            ]),
            None,
        )
    } else {
        (
            (!sidecar.command.is_empty()).then(|| sidecar.command.clone()),
            (!sidecar.args.is_empty()).then(|| sidecar.args.clone()),
        )
    };

    Container {
        name: sidecar.name.clone(),
        image: Some(image),
        image_pull_policy: Some(pull_policy),
        command,
        args,
        env: Some(env_vars),
        volume_mounts: Some(vec![shared_mount()]),
        ..Default::default()
    }
}

/// Apply `template` to `pod` and mark it injected by `profile`
pub fn inject(pod: &mut Pod, profile: &ProxyProfile, template: SidecarTemplate) {
    if let Some(spec) = pod.spec.as_mut() {
        for container in &mut spec.containers {
            container
                .env
                .get_or_insert_with(Vec::new)
                .extend(template.service_env.iter().cloned());
        }
        let app_containers = std::mem::take(&mut spec.containers);
        spec.containers = template.containers;
        spec.containers.extend(app_containers);

        spec.init_containers
            .get_or_insert_with(Vec::new)
            .extend(template.init_containers);
        spec.volumes
            .get_or_insert_with(Vec::new)
            .extend(template.volumes);
    }

    pod.annotations_mut().insert(
        INJECT_STATUS_ANNOTATION.to_string(),
        INJECT_STATUS_INJECTED.to_string(),
    );
    pod.labels_mut()
        .insert(PROXY_PROFILE_LABEL.to_string(), profile.name_any());
}

fn service_name(pod: &Pod) -> String {
    let labels = pod.labels();
    labels
        .get("app.kubernetes.io/name")
        .or_else(|| labels.get("app"))
        .cloned()
        .unwrap_or_default()
}

/// Mutating webhook injecting ProxyProfile sidecars into pods
pub struct SidecarInjector {
    rule: WebhookRule,
    lookup: Arc<dyn AdmissionLookup>,
    store: Arc<MeshConfigStore>,
}

impl SidecarInjector {
    /// Injector resolving profiles through `lookup`
    pub fn new(lookup: Arc<dyn AdmissionLookup>, store: Arc<MeshConfigStore>) -> Self {
        Self {
            rule: WebhookRule::new(
                "",
                "v1",
                "pods",
                &[AdmissionOperation::Create],
                RuleScope::Namespaced,
            ),
            lookup,
            store,
        }
    }

    /// The injected pod, or `None` when it is left untouched
    pub async fn mutate(&self, pod: &Pod, namespace: &str) -> Result<Option<Pod>> {
        let namespace_labels = self.lookup.namespace_labels(namespace).await?;
        if let Err(skip) = injection_decision(pod, &namespace_labels) {
            debug!(namespace, pod = %pod.name_any(), ?skip, "injection skipped");
            return Ok(None);
        }

        let config = self.store.require()?;
        let profiles = self.lookup.list_proxy_profiles().await?;
        let Some(profile) = select_profile(&profiles, namespace, pod.labels())? else {
            debug!(namespace, pod = %pod.name_any(), "no ProxyProfile matches");
            return Ok(None);
        };

        let template = sidecar_template(profile, &config, namespace, &service_name(pod));
        let mut injected = pod.clone();
        inject(&mut injected, profile, template);
        info!(
            namespace,
            pod = %pod.name_any(),
            profile = %profile.name_any(),
            "injecting sidecars"
        );
        Ok(Some(injected))
    }
}

#[async_trait]
impl AdmissionHandler for SidecarInjector {
    fn kind(&self) -> WebhookKind {
        WebhookKind::Mutating
    }

    fn rule(&self) -> &WebhookRule {
        &self.rule
    }

    // Pods keep being admitted while the control plane is down
    fn failure_policy(&self) -> &'static str {
        "Ignore"
    }

    async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        if !matches!(request.operation, Operation::Create) {
            return AdmissionResponse::from(request);
        }
        let Some(obj) = &request.object else {
            return AdmissionResponse::from(request);
        };

        let original = match serde_json::to_value(obj) {
            Ok(v) => v,
            Err(e) => return AdmissionResponse::from(request).deny(e.to_string()),
        };
        let pod: Pod = match serde_json::from_value(original.clone()) {
            Ok(p) => p,
            Err(e) => return AdmissionResponse::from(request).deny(e.to_string()),
        };
        let namespace = request
            .namespace
            .clone()
            .or_else(|| pod.namespace())
            .unwrap_or_default();

        match self.mutate(&pod, &namespace).await {
            Ok(None) => AdmissionResponse::from(request),
            Ok(Some(injected)) => match serde_json::to_value(&injected) {
                Ok(mutated) => patch_response(request, json_patch::diff(&original, &mutated).0),
                Err(e) => AdmissionResponse::from(request).deny(e.to_string()),
            },
            Err(e) => {
                warn!(namespace, error = %e, "sidecar injection failed");
                AdmissionResponse::from(request).deny(e.to_string())
            }
        }
    }
}
