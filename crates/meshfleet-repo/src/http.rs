//! HTTP client for the repo server

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument};

use crate::{content_type_for, Codebase, CodebaseRequest, RepoClient, RepoError, Result};

/// Per-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// [`RepoClient`] backed by the repo server's REST API
#[derive(Clone)]
pub struct HttpRepoClient {
    http: Client,
    api_base_url: String,
    root_url: String,
}

impl HttpRepoClient {
    /// Client for a server at `root_url` exposing its API under `api_path`
    pub fn new(root_url: &str, api_path: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RepoError::Transport {
                path: root_url.to_string(),
                message: format!("failed to build http client: {}", e),
            })?;
        let root_url = root_url.trim_end_matches('/').to_string();
        let api_base_url = format!("{}{}", root_url, api_path.trim_end_matches('/'));
        Ok(Self {
            http,
            api_base_url,
            root_url,
        })
    }

    /// Base URL every codebase path is appended to
    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    fn transport(path: &str, e: reqwest::Error) -> RepoError {
        RepoError::Transport {
            path: path.to_string(),
            message: e.to_string(),
        }
    }

    async fn check(path: &str, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(RepoError::Status {
            path: path.to_string(),
            status: status.as_u16(),
            message,
        })
    }

    async fn post_codebase(&self, path: &str, body: &CodebaseRequest) -> Result<()> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| Self::transport(path, e))?;
        Self::check(path, resp).await?;
        Ok(())
    }

    async fn fetch_created(&self, path: &str) -> Result<Codebase> {
        self.get_codebase(path)
            .await?
            .ok_or_else(|| RepoError::Status {
                path: path.to_string(),
                status: StatusCode::NOT_FOUND.as_u16(),
                message: "codebase missing right after creation".to_string(),
            })
    }
}

#[async_trait]
impl RepoClient for HttpRepoClient {
    async fn is_up(&self) -> bool {
        match self.http.get(format!("{}/", self.root_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "repo server not reachable");
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_codebase(&self, path: &str) -> Result<Option<Codebase>> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| Self::transport(path, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check(path, resp).await?;
        let codebase = resp.json::<Codebase>().await.map_err(|e| RepoError::Document {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(codebase))
    }

    #[instrument(skip(self))]
    async fn create_codebase(&self, path: &str) -> Result<Codebase> {
        self.post_codebase(
            path,
            &CodebaseRequest {
                version: 1,
                base: None,
            },
        )
        .await?;
        self.fetch_created(path).await
    }

    #[instrument(skip(self))]
    async fn derive_codebase(&self, path: &str, base: &str) -> Result<Codebase> {
        if let Some(existing) = self.get_codebase(path).await? {
            debug!(path, "codebase already derived");
            return Ok(existing);
        }
        self.post_codebase(
            path,
            &CodebaseRequest {
                version: 1,
                base: Some(base.to_string()),
            },
        )
        .await?;
        let created = self.fetch_created(path).await?;
        self.commit(path, created.version).await?;
        self.fetch_created(path).await
    }

    #[instrument(skip(self))]
    async fn get_file(&self, path: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| Self::transport(path, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check(path, resp).await?;
        let body = resp.text().await.map_err(|e| Self::transport(path, e))?;
        Ok(Some(body))
    }

    #[instrument(skip(self, content))]
    async fn upsert_file(&self, path: &str, content: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, content_type_for(path))
            .body(content.to_string())
            .send()
            .await
            .map_err(|e| Self::transport(path, e))?;
        Self::check(path, resp).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_file(&self, path: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(path))
            .send()
            .await
            .map_err(|e| Self::transport(path, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(path, resp).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn commit(&self, path: &str, current_version: i64) -> Result<()> {
        self.post_codebase(
            path,
            &CodebaseRequest {
                version: current_version + 1,
                base: None,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Batch, BatchItem};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const API: &str = "/api/v1/repo";

    fn client(server: &MockServer) -> HttpRepoClient {
        HttpRepoClient::new(&server.uri(), API).unwrap()
    }

    fn codebase_json(p: &str, version: i64) -> serde_json::Value {
        json!({ "version": version, "path": p, "files": [], "derived": [] })
    }

    #[tokio::test]
    async fn missing_codebase_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{API}/local/services")))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let found = client(&server).get_codebase("/local/services").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn server_errors_carry_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{API}/local/services")))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_codebase("/local/services")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn derive_is_noop_when_codebase_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{API}/local/ingress")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(codebase_json("/local/ingress", 3)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{API}/local/ingress")))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let codebase = client(&server)
            .derive_codebase("/local/ingress", "/base/ingress")
            .await
            .unwrap();
        assert_eq!(codebase.version, 3);
    }

    #[tokio::test]
    async fn upsert_sends_json_content_type_for_json_files() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{API}/base/ingress/config/main.json")))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .upsert_file("/base/ingress/config/main.json", "{}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn batch_writes_items_and_commits_next_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{API}/base/ingress")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(codebase_json("/base/ingress", 4)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{API}/base/ingress/config/main.json")))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{API}/base/ingress")))
            .and(body_json(json!({ "version": 5 })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let batch = Batch {
            basepath: "/base/ingress".to_string(),
            items: vec![BatchItem::new("/config", "main.json", "{}")],
        };
        client(&server).batch(&[batch]).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_is_down() {
        let repo = HttpRepoClient::new("http://127.0.0.1:1", API).unwrap();
        assert!(!repo.is_up().await);
    }
}
