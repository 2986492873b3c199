//! ProxyProfile reconciler
//!
//! `Local` profiles keep a ConfigMap with their inline scripts in every
//! namespace that asks for injection. `Remote` profiles get their sidecar
//! codebases derived in the repo. A spec change restarts the injected
//! workloads when the profile asks for it; the first observation of a
//! profile only records its spec hash.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::crd::{
    ProxyMode, ProxyProfile, ProxyProfileStatus, RestartPolicy, RestartScope,
};
use meshfleet_common::events::{actions, reasons, EventPublisher};
use meshfleet_common::kube_utils::{ignore_not_found, restart_patch};
use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{
    Error, Result, CONFIG_HASH_ANNOTATION, FIELD_MANAGER, INJECT_KEY, PART_OF_LABEL,
    PART_OF_VALUE, PROXY_PROFILE_LABEL,
};
use meshfleet_config::MeshConfigStore;
use meshfleet_repo::RepoClient;

const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// Workload kinds a restart of scope `Owner` rolls out
const RESTARTABLE_KINDS: [&str; 3] = ["Deployment", "StatefulSet", "DaemonSet"];

/// Cluster access of the ProxyProfile reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProfileKube: Send + Sync {
    /// Namespaces labelled for injection
    async fn injected_namespaces(&self) -> Result<Vec<String>>;
    /// ConfigMaps of profile `name` in every namespace
    async fn profile_config_maps(&self, name: &str) -> Result<Vec<ConfigMap>>;
    /// Server-side apply a ConfigMap
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;
    /// Delete a ConfigMap; missing is fine
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;
    /// Pods injected with profile `name`, optionally in one namespace
    async fn injected_pods(&self, name: &str, namespace: Option<String>) -> Result<Vec<Pod>>;
    /// Delete a pod; missing is fine
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    /// Deployment owning ReplicaSet `name`, if any
    async fn replica_set_owner(&self, namespace: &str, name: &str) -> Result<Option<String>>;
    /// Stamp the restart annotation on a workload's pod template
    async fn restart_workload(&self, kind: &str, namespace: &str, name: &str) -> Result<()>;
    /// Replace the status of profile `name`
    async fn patch_status(&self, name: &str, status: &ProxyProfileStatus) -> Result<()>;
}

/// [`ProfileKube`] over the API server
pub struct KubeProfileApi {
    client: Client,
}

impl KubeProfileApi {
    /// Talks to the cluster through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProfileKube for KubeProfileApi {
    async fn injected_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(&format!("{INJECT_KEY}=true")))
            .await?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn profile_config_maps(&self, name: &str) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(&format!("{PROXY_PROFILE_LABEL}={name}")))
            .await?;
        Ok(list.items)
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map.namespace().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &config_map.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(config_map),
        )
        .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn injected_pods(&self, name: &str, namespace: Option<String>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default().labels(&format!("{PROXY_PROFILE_LABEL}={name}")))
            .await?;
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn replica_set_owner(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let Some(rs) = ignore_not_found(api.get(name).await)? else {
            return Ok(None);
        };
        Ok(rs
            .owner_references()
            .iter()
            .find(|o| o.controller.unwrap_or(false) && o.kind == "Deployment")
            .map(|o| o.name.clone()))
    }

    async fn restart_workload(&self, kind: &str, namespace: &str, name: &str) -> Result<()> {
        let patch = restart_patch(Utc::now());
        let params = PatchParams::default();
        match kind {
            "Deployment" => {
                Api::<Deployment>::namespaced(self.client.clone(), namespace)
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            "StatefulSet" => {
                Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            "DaemonSet" => {
                Api::<DaemonSet>::namespaced(self.client.clone(), namespace)
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            other => {
                return Err(Error::internal_with_context(
                    "restart_workload",
                    format!("cannot restart kind {other}"),
                ))
            }
        }
        Ok(())
    }

    async fn patch_status(&self, name: &str, status: &ProxyProfileStatus) -> Result<()> {
        let api: Api<ProxyProfile> = Api::all(self.client.clone());
        let body = json!({
            "apiVersion": ProxyProfile::api_version(&()),
            "kind": ProxyProfile::kind(&()),
            "status": status,
        });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&body),
        )
        .await?;
        Ok(())
    }
}

/// Shared state of the ProxyProfile controller
pub struct ProfileContext {
    /// Cluster access
    pub kube: Arc<dyn ProfileKube>,
    /// Repo for `Remote` sidecar codebases
    pub repo: Arc<dyn RepoClient>,
    /// Current mesh config
    pub mesh_config: Arc<MeshConfigStore>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

/// Sidecar codebases of a `Remote` profile as `(codebase, parent)` pairs.
///
/// Cluster placeholders are filled from `config`. Paths that still depend on
/// the pod (`{namespace}`, `{service}`) are left to the init container.
pub fn sidecar_codebases(profile: &ProxyProfile, config: &MeshConfig) -> Vec<(String, String)> {
    if profile.spec.disabled || profile.spec.mode != ProxyMode::Remote {
        return Vec::new();
    }
    let default_parent = config.services_codebase_path();
    profile
        .spec
        .sidecars
        .iter()
        .filter_map(|sidecar| {
            let path = render_cluster_vars(&profile.sidecar_codebase_path(sidecar), config);
            let parent = sidecar
                .parent_codebase_path
                .as_deref()
                .or(profile.spec.parent_codebase_path.as_deref())
                .map(|p| render_cluster_vars(p, config))
                .unwrap_or_else(|| default_parent.clone());
            if path.contains('{') || parent.contains('{') {
                debug!(%path, "codebase depends on the pod, left to the init container");
                return None;
            }
            Some((
                path.trim_end_matches('/').to_string(),
                parent.trim_end_matches('/').to_string(),
            ))
        })
        .collect()
}

fn render_cluster_vars(template: &str, config: &MeshConfig) -> String {
    let cluster = &config.cluster;
    template
        .replace("{region}", &cluster.region)
        .replace("{zone}", &cluster.zone)
        .replace("{group}", &cluster.group)
        .replace("{cluster}", &cluster.name)
}

/// ConfigMap holding the inline scripts of `profile` in `namespace`
pub fn desired_config_map(profile: &ProxyProfile, namespace: &str, config_hash: &str) -> ConfigMap {
    let labels = BTreeMap::from([
        (PROXY_PROFILE_LABEL.to_string(), profile.name_any()),
        (PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string()),
    ]);
    let annotations = BTreeMap::from([(CONFIG_HASH_ANNOTATION.to_string(), config_hash.to_string())]);
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(profile.config_map_name()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: profile.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        data: Some(profile.spec.config.clone()),
        ..Default::default()
    }
}

/// Namespaces that should carry the profile's ConfigMap
fn target_namespaces(profile: &ProxyProfile, injected: Vec<String>) -> BTreeSet<String> {
    injected
        .into_iter()
        .filter(|ns| match &profile.spec.namespace {
            Some(only) => only == ns,
            None => true,
        })
        .collect()
}

async fn sync_config_maps(
    profile: &ProxyProfile,
    kube: &dyn ProfileKube,
) -> Result<BTreeMap<String, String>> {
    let name = profile.name_any();
    let targets = if profile.spec.disabled || profile.spec.mode != ProxyMode::Local {
        BTreeSet::new()
    } else {
        target_namespaces(profile, kube.injected_namespaces().await?)
    };
    let hash = profile.spec.config_hash()?;
    let existing = kube.profile_config_maps(&name).await?;

    let mut applied = BTreeMap::new();
    for namespace in &targets {
        let current = existing
            .iter()
            .find(|cm| cm.namespace().as_deref() == Some(namespace.as_str()));
        let up_to_date = current
            .and_then(|cm| cm.annotations().get(CONFIG_HASH_ANNOTATION))
            .is_some_and(|h| *h == hash);
        if !up_to_date {
            kube.apply_config_map(&desired_config_map(profile, namespace, &hash))
                .await?;
            info!(profile = %name, %namespace, "profile ConfigMap applied");
        }
        applied.insert(namespace.clone(), profile.config_map_name());
    }

    for stale in existing.iter().filter(|cm| {
        cm.namespace()
            .map(|ns| !targets.contains(&ns))
            .unwrap_or(false)
    }) {
        let namespace = stale.namespace().unwrap_or_default();
        kube.delete_config_map(&namespace, &stale.name_any()).await?;
        info!(profile = %name, %namespace, "stale profile ConfigMap deleted");
    }
    Ok(applied)
}

async fn derive_sidecar_codebases(
    profile: &ProxyProfile,
    config: &MeshConfig,
    repo: &dyn RepoClient,
) -> Result<()> {
    for (path, parent) in sidecar_codebases(profile, config) {
        repo.derive_codebase(&path, &parent).await?;
        debug!(profile = %profile.name_any(), %path, %parent, "sidecar codebase derived");
    }
    Ok(())
}

/// Workloads owning the injected pods, as `(kind, namespace, name)`
async fn owning_workloads(
    pods: &[Pod],
    kube: &dyn ProfileKube,
) -> Result<BTreeSet<(String, String, String)>> {
    let mut owners = BTreeSet::new();
    for pod in pods {
        let namespace = pod.namespace().unwrap_or_default();
        let Some(owner) = pod
            .owner_references()
            .iter()
            .find(|o| o.controller.unwrap_or(false))
        else {
            continue;
        };
        if owner.kind == "ReplicaSet" {
            if let Some(deployment) = kube.replica_set_owner(&namespace, &owner.name).await? {
                owners.insert(("Deployment".to_string(), namespace, deployment));
            }
        } else if RESTARTABLE_KINDS.contains(&owner.kind.as_str()) {
            owners.insert((owner.kind.clone(), namespace, owner.name.clone()));
        }
    }
    Ok(owners)
}

async fn restart(profile: &ProxyProfile, ctx: &ProfileContext) -> Result<()> {
    let name = profile.name_any();
    let object = profile.object_ref(&());
    if profile.spec.restart_scope == RestartScope::Sidecar {
        warn!(profile = %name, "restart scope Sidecar is not supported");
        ctx.events
            .publish(
                &object,
                EventType::Warning,
                reasons::UNSUPPORTED_RESTART_SCOPE,
                actions::RESTART,
                Some("sidecar containers cannot be restarted in place".to_string()),
            )
            .await;
        return Ok(());
    }

    let pods = ctx
        .kube
        .injected_pods(&name, profile.spec.namespace.clone())
        .await?;
    let note = match profile.spec.restart_scope {
        RestartScope::Pod => {
            for pod in &pods {
                ctx.kube
                    .delete_pod(&pod.namespace().unwrap_or_default(), &pod.name_any())
                    .await?;
            }
            format!("deleted {} injected pods", pods.len())
        }
        _ => {
            let owners = owning_workloads(&pods, ctx.kube.as_ref()).await?;
            for (kind, namespace, workload) in &owners {
                ctx.kube.restart_workload(kind, namespace, workload).await?;
                debug!(profile = %name, %kind, %namespace, %workload, "workload restarted");
            }
            format!("restarted {} workloads", owners.len())
        }
    };
    info!(profile = %name, "{note}");
    ctx.events
        .publish(
            &object,
            EventType::Normal,
            reasons::RESTARTED,
            actions::RESTART,
            Some(note),
        )
        .await;
    Ok(())
}

/// Reconcile one ProxyProfile
#[instrument(skip(profile, ctx), fields(profile = %profile.name_any()))]
pub async fn reconcile(profile: Arc<ProxyProfile>, ctx: Arc<ProfileContext>) -> Result<Action> {
    let name = profile.name_any();
    let config = ctx.mesh_config.require()?;
    let current = profile.status.clone().unwrap_or_default();

    let config_maps = sync_config_maps(&profile, ctx.kube.as_ref()).await?;
    derive_sidecar_codebases(&profile, &config, ctx.repo.as_ref()).await?;

    let spec_hash = profile.spec.spec_hash()?;
    match current.last_applied_spec_hash.as_deref() {
        None => debug!(profile = %name, "first observation, recording spec hash"),
        Some(last) if last == spec_hash => {}
        Some(_) if profile.spec.restart_policy == RestartPolicy::Always => {
            restart(&profile, &ctx).await?
        }
        Some(_) => debug!(profile = %name, "spec changed, restart policy Never"),
    }

    let status = ProxyProfileStatus {
        last_applied_spec_hash: Some(spec_hash),
        config_maps,
    };
    if status != current {
        ctx.kube.patch_status(&name, &status).await?;
    }
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Requeue a failed reconcile
pub fn error_policy(profile: Arc<ProxyProfile>, error: &Error, _ctx: Arc<ProfileContext>) -> Action {
    error!(?error, profile = %profile.name_any(), "proxy profile reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}
