//! Mesh config snapshot and change dispatch

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use meshfleet_common::kube_utils::{ignore_not_found, poll_until};
use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{Error, Result, FIELD_MANAGER, MESH_CONFIG_KEY, MESH_CONFIG_NAME};

/// Reacts to mesh config changes.
///
/// Errors are logged by the store and never reach other listeners.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeshConfigListener: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// First snapshot observed
    async fn on_create(&self, config: Arc<MeshConfig>) -> Result<()>;

    /// Snapshot replaced by a different one
    async fn on_update(&self, old: Arc<MeshConfig>, new: Arc<MeshConfig>) -> Result<()>;

    /// ConfigMap removed; `config` is the last snapshot
    async fn on_delete(&self, config: Arc<MeshConfig>) -> Result<()>;
}

/// Current mesh config plus the listeners notified when it changes
pub struct MeshConfigStore {
    current: RwLock<Option<Arc<MeshConfig>>>,
    listeners: Vec<Arc<dyn MeshConfigListener>>,
}

impl MeshConfigStore {
    /// Store dispatching to `listeners` in the given order
    pub fn new(listeners: Vec<Arc<dyn MeshConfigListener>>) -> Self {
        Self {
            current: RwLock::new(None),
            listeners,
        }
    }

    /// Store preloaded with a snapshot and no listeners
    pub fn with_config(config: MeshConfig) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(config))),
            listeners: Vec::new(),
        }
    }

    /// Current snapshot, if loaded
    pub fn current(&self) -> Option<Arc<MeshConfig>> {
        self.current.read().clone()
    }

    /// Current snapshot or a transient error when none is loaded yet
    pub fn require(&self) -> Result<Arc<MeshConfig>> {
        self.current()
            .ok_or_else(|| Error::transient("mesh config", "mesh config not loaded yet"))
    }

    /// Wait until a snapshot is loaded
    pub async fn wait_loaded(&self, timeout: Duration) -> Result<Arc<MeshConfig>> {
        let store = self;
        poll_until(
            timeout,
            Duration::from_millis(500),
            "mesh config was not loaded in time",
            move || async move { Ok(store.current().is_some()) },
        )
        .await?;
        self.require()
    }

    /// Apply a raw document; `None` means the ConfigMap is gone
    pub async fn apply_document(&self, document: Option<&str>) {
        match document {
            None => self.remove().await,
            Some(raw) => match MeshConfig::parse(raw) {
                Ok(config) => self.update(config).await,
                Err(e) => {
                    warn!(error = %e, "ignoring invalid mesh config, keeping previous snapshot")
                }
            },
        }
    }

    /// Swap in a new snapshot and notify listeners when it differs
    pub async fn update(&self, config: MeshConfig) {
        let new = Arc::new(config);
        let old = {
            let mut guard = self.current.write();
            if guard.as_deref() == Some(new.as_ref()) {
                debug!("mesh config unchanged");
                return;
            }
            guard.replace(new.clone())
        };

        for listener in &self.listeners {
            let result = match &old {
                None => listener.on_create(new.clone()).await,
                Some(old) => listener.on_update(old.clone(), new.clone()).await,
            };
            if let Err(e) = result {
                error!(listener = listener.name(), error = %e, "mesh config listener failed");
            }
        }
    }

    /// Drop the snapshot and notify listeners
    pub async fn remove(&self) {
        let old = self.current.write().take();
        let Some(old) = old else {
            return;
        };
        warn!("mesh config removed");
        for listener in &self.listeners {
            if let Err(e) = listener.on_delete(old.clone()).await {
                error!(listener = listener.name(), error = %e, "mesh config listener failed");
            }
        }
    }

    /// Watch the mesh config ConfigMap until `cancel` fires
    pub async fn run(self: Arc<Self>, client: Client, namespace: String, cancel: CancellationToken) {
        let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
        let config = watcher::Config::default()
            .fields(&format!("metadata.name={}", MESH_CONFIG_NAME))
            .timeout(25);
        let mut stream = watcher(api, config).default_backoff().boxed();
        info!(namespace = %namespace, "watching mesh config");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("mesh config watch stopped");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Apply(cm) | watcher::Event::InitApply(cm))) => {
                        match document_of(&cm) {
                            Some(doc) => self.apply_document(Some(doc)).await,
                            None => warn!(key = MESH_CONFIG_KEY, "mesh config ConfigMap has no document"),
                        }
                    }
                    Some(Ok(watcher::Event::Delete(_))) => self.apply_document(None).await,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(error = %e, "mesh config watch error"),
                    None => return,
                }
            }
        }
    }
}

fn document_of(cm: &ConfigMap) -> Option<&str> {
    cm.data
        .as_ref()
        .and_then(|d| d.get(MESH_CONFIG_KEY))
        .map(String::as_str)
}

/// Reads and writes the mesh config document of one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeshConfigApi: Send + Sync {
    /// Current document; `None` when the ConfigMap is missing
    async fn load(&self) -> Result<Option<MeshConfig>>;

    /// Replace the document
    async fn save(&self, config: &MeshConfig) -> Result<()>;
}

/// [`MeshConfigApi`] over the ConfigMap of a cluster
pub struct KubeMeshConfigApi {
    client: Client,
    namespace: String,
}

impl KubeMeshConfigApi {
    /// Access the mesh config in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl MeshConfigApi for KubeMeshConfigApi {
    async fn load(&self) -> Result<Option<MeshConfig>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let Some(cm) = ignore_not_found(api.get(MESH_CONFIG_NAME).await)? else {
            return Ok(None);
        };
        match document_of(&cm) {
            Some(doc) => Ok(Some(MeshConfig::parse(doc)?)),
            None => Err(Error::not_found("MeshConfig", MESH_CONFIG_KEY)),
        }
    }

    async fn save(&self, config: &MeshConfig) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let data = BTreeMap::from([(MESH_CONFIG_KEY.to_string(), config.to_json()?)]);
        let patch = serde_json::json!({ "data": data });
        api.patch(
            MESH_CONFIG_NAME,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}
