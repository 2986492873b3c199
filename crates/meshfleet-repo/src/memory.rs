//! In-memory repo server model

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{Codebase, RepoClient, RepoError, Result};

#[derive(Clone, Debug, Default)]
struct StoredCodebase {
    version: i64,
    base: Option<String>,
    commits: u32,
}

#[derive(Debug, Default)]
struct State {
    codebases: BTreeMap<String, StoredCodebase>,
    files: BTreeMap<String, String>,
}

impl State {
    /// Longest codebase path that prefixes `file_path`
    fn owner_of(&self, file_path: &str) -> Option<(&String, &StoredCodebase)> {
        self.codebases
            .iter()
            .filter(|(p, _)| {
                file_path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(p, _)| p.len())
    }

    fn lookup(&self, file_path: &str, depth: usize) -> Option<String> {
        if let Some(content) = self.files.get(file_path) {
            return Some(content.clone());
        }
        if depth > 16 {
            return None;
        }
        let (owner, stored) = self.owner_of(file_path)?;
        let base = stored.base.as_ref()?;
        let relative = &file_path[owner.len()..];
        self.lookup(&format!("{}{}", base, relative), depth + 1)
    }

    fn codebase(&self, path: &str) -> Option<Codebase> {
        let stored = self.codebases.get(path)?;
        let prefix = format!("{}/", path);
        let files = self
            .files
            .keys()
            .filter(|f| f.starts_with(&prefix))
            .map(|f| f[path.len()..].to_string())
            .collect();
        let derived = self
            .codebases
            .iter()
            .filter(|(_, c)| c.base.as_deref() == Some(path))
            .map(|(p, _)| p.clone())
            .collect();
        Some(Codebase {
            version: stored.version,
            path: path.to_string(),
            base: stored.base.clone().unwrap_or_default(),
            files,
            derived,
            ..Default::default()
        })
    }
}

/// [`RepoClient`] that keeps codebases in memory with the server's rules:
/// versions only move forward, derived codebases see their base's files,
/// and nothing is reachable while the server is marked down.
#[derive(Debug)]
pub struct MemoryRepoClient {
    state: Mutex<State>,
    up: AtomicBool,
}

impl Default for MemoryRepoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepoClient {
    /// Empty repo that is up
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            up: AtomicBool::new(true),
        }
    }

    /// Mark the server reachable or not
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Drop every codebase and file, as after a server restart without storage
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.codebases.clear();
        state.files.clear();
    }

    /// Committed version of a codebase
    pub fn version(&self, path: &str) -> Option<i64> {
        self.state.lock().codebases.get(path).map(|c| c.version)
    }

    /// Number of commits a codebase received after creation
    pub fn commit_count(&self, path: &str) -> u32 {
        self.state
            .lock()
            .codebases
            .get(path)
            .map(|c| c.commits)
            .unwrap_or(0)
    }

    /// Overwrite a codebase's version, creating it if needed
    pub fn force_version(&self, path: &str, version: i64) {
        self.state
            .lock()
            .codebases
            .entry(path.to_string())
            .or_default()
            .version = version;
    }

    /// Content of a file, following the base chain
    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().lookup(path, 0)
    }

    /// Paths of all codebases
    pub fn codebase_paths(&self) -> Vec<String> {
        self.state.lock().codebases.keys().cloned().collect()
    }

    fn ensure_up(&self, path: &str) -> Result<()> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepoError::Transport {
                path: path.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn insert(&self, path: &str, base: Option<&str>) -> Result<Codebase> {
        let mut state = self.state.lock();
        if state.codebases.contains_key(path) {
            return Err(RepoError::Status {
                path: path.to_string(),
                status: 409,
                message: "codebase already exists".to_string(),
            });
        }
        if let Some(base) = base {
            if !state.codebases.contains_key(base) {
                return Err(RepoError::Status {
                    path: path.to_string(),
                    status: 400,
                    message: format!("base codebase {} does not exist", base),
                });
            }
        }
        state.codebases.insert(
            path.to_string(),
            StoredCodebase {
                version: 1,
                base: base.map(str::to_string),
                commits: 0,
            },
        );
        state.codebase(path).ok_or_else(|| RepoError::Document {
            path: path.to_string(),
            message: "codebase vanished".to_string(),
        })
    }
}

#[async_trait]
impl RepoClient for MemoryRepoClient {
    async fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    async fn get_codebase(&self, path: &str) -> Result<Option<Codebase>> {
        self.ensure_up(path)?;
        Ok(self.state.lock().codebase(path))
    }

    async fn create_codebase(&self, path: &str) -> Result<Codebase> {
        self.ensure_up(path)?;
        self.insert(path, None)
    }

    async fn derive_codebase(&self, path: &str, base: &str) -> Result<Codebase> {
        self.ensure_up(path)?;
        if let Some(existing) = self.state.lock().codebase(path) {
            return Ok(existing);
        }
        let created = self.insert(path, Some(base))?;
        self.commit(path, created.version).await?;
        self.get_codebase(path).await?.ok_or_else(|| RepoError::Document {
            path: path.to_string(),
            message: "codebase vanished".to_string(),
        })
    }

    async fn get_file(&self, path: &str) -> Result<Option<String>> {
        self.ensure_up(path)?;
        Ok(self.state.lock().lookup(path, 0))
    }

    async fn upsert_file(&self, path: &str, content: &str) -> Result<()> {
        self.ensure_up(path)?;
        let mut state = self.state.lock();
        if state.owner_of(path).is_none() {
            return Err(RepoError::Status {
                path: path.to_string(),
                status: 404,
                message: "no codebase owns this file".to_string(),
            });
        }
        state.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.ensure_up(path)?;
        self.state.lock().files.remove(path);
        Ok(())
    }

    async fn commit(&self, path: &str, current_version: i64) -> Result<()> {
        self.ensure_up(path)?;
        let mut state = self.state.lock();
        let stored = state
            .codebases
            .get_mut(path)
            .ok_or_else(|| RepoError::Status {
                path: path.to_string(),
                status: 404,
                message: "codebase not found".to_string(),
            })?;
        let next = current_version + 1;
        if next <= stored.version {
            return Err(RepoError::Status {
                path: path.to_string(),
                status: 400,
                message: format!("version {} is not newer than {}", next, stored.version),
            });
        }
        stored.version = next;
        stored.commits += 1;
        Ok(())
    }
}
