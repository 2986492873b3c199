//! Remote logging settings in the ingress pipeline

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use meshfleet_common::mesh_config::MeshConfig;
use meshfleet_common::{Error, Result, INGRESS_BASE_PATH};
use meshfleet_repo::documents::{self, set_value, CONFIG_DIR, MAIN_JSON};

use super::ListenerContext;
use crate::store::MeshConfigListener;

/// Copies the logging endpoint and token from the referenced Secret into
/// `main.json`
pub struct LoggingListener {
    ctx: ListenerContext,
}

impl LoggingListener {
    /// Listener over `ctx`
    pub fn new(ctx: ListenerContext) -> Self {
        Self { ctx }
    }

    async fn apply(&self, config: &MeshConfig) -> Result<()> {
        let logging = &config.logging;
        let values = if logging.enabled {
            let data = self
                .ctx
                .kube
                .secret_data(&logging.secret_name)
                .await?
                .ok_or_else(|| Error::not_found("Secret", logging.secret_name.clone()))?;
            vec![
                ("logging.enabled", json!(true)),
                ("logging.url", json!(data.get("url").cloned().unwrap_or_default())),
                ("logging.token", json!(data.get("token").cloned().unwrap_or_default())),
            ]
        } else {
            vec![("logging.enabled", json!(false))]
        };

        documents::update_json_document(
            self.ctx.repo.as_ref(),
            INGRESS_BASE_PATH,
            CONFIG_DIR,
            MAIN_JSON,
            |doc| {
                for (key, value) in values {
                    set_value(doc, key, value)?;
                }
                Ok(())
            },
        )
        .await?;
        info!(enabled = logging.enabled, "logging configuration updated");
        Ok(())
    }
}

#[async_trait]
impl MeshConfigListener for LoggingListener {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn on_create(&self, config: Arc<MeshConfig>) -> Result<()> {
        if config.logging.enabled {
            self.apply(&config).await?;
        }
        Ok(())
    }

    async fn on_update(&self, old: Arc<MeshConfig>, new: Arc<MeshConfig>) -> Result<()> {
        if old.logging != new.logging {
            self.apply(&new).await?;
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
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn enabling_copies_secret_values() {
        let repo = seeded_repo().await;
        let mut kube = MockListenerKubeClient::new();
        kube.expect_secret_data()
            .with(eq("meshfleet-logging"))
            .times(1)
            .returning(|_| {
                Ok(Some(BTreeMap::from([
                    ("url".to_string(), "https://logs.example.com".to_string()),
                    ("token".to_string(), "s3cr3t".to_string()),
                ])))
            });

        let listener = LoggingListener::new(context(repo.clone(), kube, MockCertManager::new()));
        let mut new = sample();
        new.logging.enabled = true;
        listener
            .on_update(Arc::new(sample()), Arc::new(new))
            .await
            .unwrap();

        let doc = main_json(&repo).await;
        assert_eq!(doc["logging"]["enabled"], true);
        assert_eq!(doc["logging"]["url"], "https://logs.example.com");
        assert_eq!(doc["logging"]["token"], "s3cr3t");
    }

    #[tokio::test]
    async fn missing_secret_is_an_error() {
        let repo = seeded_repo().await;
        let mut kube = MockListenerKubeClient::new();
        kube.expect_secret_data().returning(|_| Ok(None));

        let listener = LoggingListener::new(context(repo.clone(), kube, MockCertManager::new()));
        let mut config = sample();
        config.logging.enabled = true;
        let err = listener.on_create(Arc::new(config)).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(repo.commit_count(INGRESS_BASE_PATH), 0);
    }

    #[tokio::test]
    async fn disabling_only_flips_flag() {
        let repo = seeded_repo().await;
        let mut kube = MockListenerKubeClient::new();
        kube.expect_secret_data().never();

        let listener = LoggingListener::new(context(repo.clone(), kube, MockCertManager::new()));
        let mut old = sample();
        old.logging.enabled = true;
        listener
            .on_update(Arc::new(old), Arc::new(sample()))
            .await
            .unwrap();

        let doc = main_json(&repo).await;
        assert_eq!(doc["logging"], json!({ "enabled": false }));
    }
}
