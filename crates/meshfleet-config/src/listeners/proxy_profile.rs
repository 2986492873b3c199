//! Proxy image rollover for ProxyProfile sidecars

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{info, warn};

use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::Result;

use super::ListenerContext;
use crate::store::MeshConfigListener;

/// Rewrites sidecars still running the previous default proxy image
pub struct ProxyProfileImageListener {
    ctx: ListenerContext,
}

impl ProxyProfileImageListener {
    /// Listener over `ctx`
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MeshConfigListener for ProxyProfileImageListener {
    fn name(&self) -> &'static str {
        "proxy-profile-image"
    }

    async fn on_create(&self, _config: Arc<MeshConfig>) -> Result<()> {
        Ok(())
    }

    async fn on_update(&self, old: Arc<MeshConfig>, new: Arc<MeshConfig>) -> Result<()> {
        let (old_image, new_image) = (old.proxy_image(), new.proxy_image());
        if old_image == new_image {
            return Ok(());
        }

        for profile in self.ctx.kube.list_proxy_profiles().await? {
            let mut sidecars = profile.spec.sidecars.clone();
            let mut changed = false;
            for sidecar in sidecars
                .iter_mut()
                .filter(|s| s.image.as_deref() == Some(old_image.as_str()))
            {
                sidecar.image = Some(new_image.clone());
                changed = true;
            }
            if !changed {
                continue;
            }
            let name = profile.name_any();
            match self.ctx.kube.replace_sidecars(&name, sidecars).await {
                Ok(()) => info!(profile = %name, image = %new_image, "sidecar image updated"),
                Err(e) => warn!(profile = %name, error = %e, "failed to update sidecar image"),
            }
        }
        Ok(())
    }

    async fn on_delete(&self, _config: Arc<MeshConfig>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::MockListenerKubeClient;
    use super::*;
    use crate::cert::MockCertManager;
    use meshfleet_common::crd::{ProxyProfile, ProxyProfileSpec, Sidecar};

    fn profile(name: &str, images: &[&str]) -> ProxyProfile {
        ProxyProfile::new(
            name,
            ProxyProfileSpec {
                sidecars: images
                    .iter()
                    .enumerate()
                    .map(|(i, image)| Sidecar {
                        name: format!("sidecar-{i}"),
                        image: Some(image.to_string()),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn only_sidecars_on_old_image_move() {
        let repo = seeded_repo().await;
        let mut kube = MockListenerKubeClient::new();
        kube.expect_list_proxy_profiles().times(1).returning(|| {
            Ok(vec![
                profile("default", &["meshfleet/proxy:1.0.0", "custom/proxy:9"]),
                profile("pinned", &["custom/proxy:9"]),
            ])
        });
        kube.expect_replace_sidecars()
            .withf(|name, sidecars| {
                name == "default"
                    && sidecars[0].image.as_deref() == Some("meshfleet/proxy:2.0.0")
                    && sidecars[1].image.as_deref() == Some("custom/proxy:9")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let listener =
            ProxyProfileImageListener::new(context(repo, kube, MockCertManager::new()));
        let mut new = sample();
        new.images.proxy_image = "proxy:2.0.0".to_string();
        listener
            .on_update(Arc::new(sample()), Arc::new(new))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn same_image_lists_nothing() {
        let repo = seeded_repo().await;
        let mut kube = MockListenerKubeClient::new();
        kube.expect_list_proxy_profiles().never();

        let listener =
            ProxyProfileImageListener::new(context(repo, kube, MockCertManager::new()));
        listener
            .on_update(Arc::new(sample()), Arc::new(sample()))
            .await
            .unwrap();
    }
}
