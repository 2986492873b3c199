//! Startup helpers shared by both binaries

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use meshfleet_common::kube_utils::poll_until;
use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{Error, Result};
use meshfleet_config::MeshConfigApi;
use meshfleet_repo::{HttpRepoClient, RepoClient};

/// Interval between reads of the mesh config while waiting for it
pub const MESH_CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Wait until the mesh config ConfigMap exists and parses.
///
/// The listeners and the repo client both need values from the document,
/// so nothing else can be built before it is read once.
pub async fn load_mesh_config(
    api: &dyn MeshConfigApi,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<MeshConfig> {
    let found: Mutex<Option<MeshConfig>> = Mutex::new(None);
    let slot = &found;
    poll_until(timeout, poll_interval, "mesh config not available", move || async move {
        match api.load().await {
            Ok(Some(config)) => {
                config.validate()?;
                *slot.lock() = Some(config);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(error = %e, "mesh config not readable yet");
                Ok(false)
            }
        }
    })
    .await
    .map_err(|e| Error::fatal(format!("waiting for mesh config: {e}")))?;

    found
        .into_inner()
        .ok_or_else(|| Error::internal("mesh config poll finished without a document"))
}

/// HTTP client for the repo server named by `config`
pub fn repo_client(config: &MeshConfig) -> Result<Arc<dyn RepoClient>> {
    let client = HttpRepoClient::new(&config.repo_root_url, &config.repo_api_path)?;
    info!(url = %client.api_base_url(), "repo client ready");
    Ok(Arc::new(client))
}

/// Cancel `cancel` on SIGINT or SIGTERM
pub async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                    _ = cancel.cancelled() => return,
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = cancel.cancelled() => return,
        }
    }
    info!("shutdown signal received");
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mesh_config;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Returns nothing for the first `missing` loads
    struct EventuallyPresent {
        missing: u32,
        calls: AtomicU32,
        config: MeshConfig,
    }

    #[async_trait]
    impl MeshConfigApi for EventuallyPresent {
        async fn load(&self) -> Result<Option<MeshConfig>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.missing {
                Ok(None)
            } else {
                Ok(Some(self.config.clone()))
            }
        }

        async fn save(&self, _config: &MeshConfig) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_config_map() {
        let api = EventuallyPresent {
            missing: 3,
            calls: AtomicU32::new(0),
            config: mesh_config(),
        };
        let config = load_mesh_config(&api, Duration::from_secs(60), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(config, mesh_config());
        assert_eq!(api.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_config_is_fatal() {
        let api = EventuallyPresent {
            missing: u32::MAX,
            calls: AtomicU32::new(0),
            config: mesh_config(),
        };
        let err = load_mesh_config(&api, Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("mesh config"));
    }

    #[test]
    fn repo_client_uses_the_configured_server() {
        assert!(repo_client(&mesh_config()).is_ok());
    }
}
