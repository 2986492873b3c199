//! Client for the proxy codebase repository
//!
//! The repo server stores versioned codebases addressed by path. A codebase
//! may derive from one base codebase and inherit every file it does not
//! override. Changes become visible to proxies only when the codebase is
//! committed with a strictly larger version; the server rejects anything
//! else, which is the only ordering discipline between concurrent writers.
//!
//! [`HttpRepoClient`] talks to a real server. [`MemoryRepoClient`] models the
//! same rules in memory for tests and local runs.

#![deny(missing_docs)]

mod error;
mod http;
mod memory;

pub mod documents;

pub use error::RepoError;
pub use http::HttpRepoClient;
pub use memory::MemoryRepoClient;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result type for repo operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Codebase metadata as reported by the repo server
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Codebase {
    /// Committed version; -1 means the server has no valid version
    #[serde(default)]
    pub version: i64,
    /// Codebase path
    #[serde(default)]
    pub path: String,
    /// Entry script
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub main: String,
    /// Parent codebase
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base: String,
    /// Files owned by this codebase
    #[serde(default)]
    pub files: Vec<String>,
    /// Files changed since the last commit
    #[serde(default)]
    pub edit_files: Vec<String>,
    /// Files deleted since the last commit
    #[serde(default)]
    pub erased_files: Vec<String>,
    /// Codebases deriving from this one
    #[serde(default)]
    pub derived: Vec<String>,
}

/// Body of a codebase create/derive/commit request
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub(crate) struct CodebaseRequest {
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

/// Files to write into one codebase followed by a single commit
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    /// Codebase receiving the files; created when missing
    pub basepath: String,
    /// Files to upsert
    pub items: Vec<BatchItem>,
}

/// One file of a [`Batch`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchItem {
    /// Directory inside the codebase, e.g. `/config`
    pub path: String,
    /// File name
    pub filename: String,
    /// File content
    pub content: String,
}

impl BatchItem {
    /// Item with raw content
    pub fn new(
        path: impl Into<String>,
        filename: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            filename: filename.into(),
            content: content.into(),
        }
    }

    /// Item whose content is `value` serialized as pretty JSON
    pub fn json<T: Serialize>(
        path: impl Into<String>,
        filename: impl Into<String>,
        value: &T,
    ) -> Result<Self> {
        let path = path.into();
        let filename = filename.into();
        let content = serde_json::to_string_pretty(value).map_err(|e| RepoError::Document {
            path: format!("{}/{}", path, filename),
            message: e.to_string(),
        })?;
        Ok(Self {
            path,
            filename,
            content,
        })
    }

    /// Full repo path of the item inside `basepath`
    pub fn full_path(&self, basepath: &str) -> String {
        format!("{}{}/{}", basepath, self.path, self.filename)
    }
}

/// Operations on the codebase repository.
///
/// The client performs no retries; callers wrap calls in Fibonacci retry
/// where a failure should not be final.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepoClient: Send + Sync {
    /// True when the server answers
    async fn is_up(&self) -> bool;

    /// Fetch codebase metadata; `None` when the path does not exist
    async fn get_codebase(&self, path: &str) -> Result<Option<Codebase>>;

    /// True when a codebase exists at `path`
    async fn codebase_exists(&self, path: &str) -> Result<bool> {
        Ok(self.get_codebase(path).await?.is_some())
    }

    /// Create an empty codebase at version 1; fails if it exists
    async fn create_codebase(&self, path: &str) -> Result<Codebase>;

    /// Create `path` deriving from `base` and commit it once.
    ///
    /// Idempotent: an existing codebase is returned untouched.
    async fn derive_codebase(&self, path: &str, base: &str) -> Result<Codebase>;

    /// Read a file; `None` when it does not exist
    async fn get_file(&self, path: &str) -> Result<Option<String>>;

    /// Create or overwrite a file
    async fn upsert_file(&self, path: &str, content: &str) -> Result<()>;

    /// Delete a file
    async fn delete_file(&self, path: &str) -> Result<()>;

    /// Publish version `current_version + 1` of a codebase
    async fn commit(&self, path: &str, current_version: i64) -> Result<()>;

    /// Apply each batch: ensure the codebase, upsert items, commit once.
    ///
    /// Not atomic; a failed batch can be re-run because files are
    /// overwritable and each run commits a fresh version.
    async fn batch(&self, batches: &[Batch]) -> Result<()> {
        for batch in batches {
            let version = match self.get_codebase(&batch.basepath).await? {
                Some(codebase) => codebase.version,
                None => {
                    debug!(path = %batch.basepath, "codebase missing, creating");
                    self.create_codebase(&batch.basepath).await?.version
                }
            };

            for item in &batch.items {
                let full_path = item.full_path(&batch.basepath);
                debug!(path = %full_path, "upserting file");
                self.upsert_file(&full_path, &item.content).await?;
            }

            if version < 0 {
                return Err(RepoError::InvalidVersion {
                    path: batch.basepath.clone(),
                    version,
                });
            }
            self.commit(&batch.basepath, version).await?;
        }
        Ok(())
    }
}

/// Content type the repo server expects for a file path
pub fn content_type_for(path: &str) -> &'static str {
    if path.ends_with(".json") {
        "application/json"
    } else {
        "text/plain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use mockall::Sequence;

    #[test]
    fn content_type_follows_suffix() {
        assert_eq!(content_type_for("/base/ingress/config/main.json"), "application/json");
        assert_eq!(content_type_for("/base/ingress/main.js"), "text/plain");
    }

    #[test]
    fn batch_item_paths_join_under_basepath() {
        let item = BatchItem::new("/config", "main.json", "{}");
        assert_eq!(item.full_path("/base/ingress"), "/base/ingress/config/main.json");
    }

    #[tokio::test]
    async fn batch_creates_missing_codebase_then_commits_once() {
        let mut repo = MockRepoClient::new();
        let mut seq = Sequence::new();

        repo.expect_get_codebase()
            .with(eq("/local/services"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        repo.expect_create_codebase()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|p| {
                Ok(Codebase {
                    version: 1,
                    path: p.to_string(),
                    ..Default::default()
                })
            });
        repo.expect_upsert_file()
            .with(eq("/local/services/config/registry.json"), eq("{}"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        repo.expect_commit()
            .with(eq("/local/services"), eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        // MockRepoClient overrides the default method, so drive the
        // provided implementation through a thin wrapper.
        struct Provided(MockRepoClient);
        #[async_trait]
        impl RepoClient for Provided {
            async fn is_up(&self) -> bool {
                self.0.is_up().await
            }
            async fn get_codebase(&self, path: &str) -> Result<Option<Codebase>> {
                self.0.get_codebase(path).await
            }
            async fn create_codebase(&self, path: &str) -> Result<Codebase> {
                self.0.create_codebase(path).await
            }
            async fn derive_codebase(&self, path: &str, base: &str) -> Result<Codebase> {
                self.0.derive_codebase(path, base).await
            }
            async fn get_file(&self, path: &str) -> Result<Option<String>> {
                self.0.get_file(path).await
            }
            async fn upsert_file(&self, path: &str, content: &str) -> Result<()> {
                self.0.upsert_file(path, content).await
            }
            async fn delete_file(&self, path: &str) -> Result<()> {
                self.0.delete_file(path).await
            }
            async fn commit(&self, path: &str, current_version: i64) -> Result<()> {
                self.0.commit(path, current_version).await
            }
        }

        let batch = Batch {
            basepath: "/local/services".to_string(),
            items: vec![BatchItem::new("/config", "registry.json", "{}")],
        };
        Provided(repo).batch(&[batch]).await.unwrap();
    }

    #[tokio::test]
    async fn batch_stops_on_invalid_version() {
        let repo = MemoryRepoClient::new();
        repo.force_version("/base/ingress", -1);

        let batch = Batch {
            basepath: "/base/ingress".to_string(),
            items: vec![BatchItem::new("/config", "main.json", "{}")],
        };
        let err = repo.batch(&[batch]).await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidVersion { version: -1, .. }));
    }
}
