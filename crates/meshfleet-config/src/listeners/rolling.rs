//! Rolling restart of mesh components

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::Result;

use super::ListenerContext;
use crate::store::MeshConfigListener;

/// Restarts the mesh Deployments when settings they read from their
/// environment change
pub struct RollingRestartListener {
    ctx: ListenerContext,
}

impl RollingRestartListener {
    /// Listener over `ctx`
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }
}

fn env_changed(old: &MeshConfig, new: &MeshConfig) -> bool {
    old.repo_root_url != new.repo_root_url
        || old.repo_path != new.repo_path
        || old.repo_api_path != new.repo_api_path
        || old.cluster != new.cluster
        || old.images != new.images
}

#[async_trait]
impl MeshConfigListener for RollingRestartListener {
    fn name(&self) -> &'static str {
        "rolling-restart"
    }

    async fn on_create(&self, _config: Arc<MeshConfig>) -> Result<()> {
        Ok(())
    }

    async fn on_update(&self, old: Arc<MeshConfig>, new: Arc<MeshConfig>) -> Result<()> {
        if env_changed(&old, &new) {
            info!("mesh environment changed, restarting mesh components");
            self.ctx.kube.restart_mesh_deployments().await?;
        }
        Ok(())
    }

    async fn on_delete(&self, _config: Arc<MeshConfig>) -> Result<()> {
        Ok(())
    }
}
