//! Bounded-frequency sync runner and hash-gated document pushes

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use meshfleet_common::kube_utils::hash_value;
use meshfleet_common::Result;
use meshfleet_repo::documents::CONFIG_DIR;
use meshfleet_repo::{Batch, BatchItem, RepoClient};

/// Minimum spacing between two runs
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(3);
/// A run happens at least this often
pub const SYNC_PERIOD: Duration = Duration::from_secs(30);

/// Runs a sync function on demand, at most every `min_interval` and at
/// least every `period`
#[derive(Clone)]
pub struct BoundedRunner {
    min_interval: Duration,
    period: Duration,
    trigger: Arc<Notify>,
}

impl Default for BoundedRunner {
    fn default() -> Self {
        Self::new(MIN_SYNC_INTERVAL, SYNC_PERIOD)
    }
}

impl BoundedRunner {
    /// Runner with explicit bounds
    pub fn new(min_interval: Duration, period: Duration) -> Self {
        Self {
            min_interval,
            period,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Request a run as soon as the minimum interval allows.
    ///
    /// Requests made while a run is in progress coalesce into one more run.
    pub fn request(&self) {
        self.trigger.notify_one();
    }

    /// Run `sync` until `cancel` fires
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, mut sync: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let started = Instant::now();
            sync().await;

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(self.period) => {}
            }

            let elapsed = started.elapsed();
            if elapsed < self.min_interval {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.min_interval - elapsed) => {}
                }
            }
        }
    }
}

/// Writes generated documents into `<codebase>/config/` when their content
/// hash changes
pub struct DocumentPusher {
    repo: Arc<dyn RepoClient>,
    pushed: HashMap<String, String>,
}

impl DocumentPusher {
    /// Pusher writing through `repo`
    pub fn new(repo: Arc<dyn RepoClient>) -> Self {
        Self {
            repo,
            pushed: HashMap::new(),
        }
    }

    /// Push `document` as `filename` into `codebase`.
    ///
    /// Returns false when nothing was written: the codebase does not exist
    /// yet, or it still holds the file and the hash matches the last
    /// successful push. A codebase that lost the file, as after a repo
    /// server restart, is written again. A failed push is not recorded, so
    /// the next run tries again.
    pub async fn push<T: Serialize>(
        &mut self,
        codebase: &str,
        filename: &str,
        document: &T,
    ) -> Result<bool> {
        let target = format!("{codebase}{CONFIG_DIR}/{filename}");
        let Some(current) = self.repo.get_codebase(codebase).await? else {
            self.pushed.remove(&target);
            debug!(codebase, "codebase not derived yet, skipping push");
            return Ok(false);
        };

        let hash = hash_value(document)?;
        let relative = format!("{CONFIG_DIR}/{filename}");
        let present = current.files.iter().any(|f| *f == relative);
        if present && self.pushed.get(&target) == Some(&hash) {
            return Ok(false);
        }

        let batch = Batch {
            basepath: codebase.to_string(),
            items: vec![BatchItem::json(CONFIG_DIR, filename, document)?],
        };
        self.repo.batch(&[batch]).await?;
        info!(document = %target, hash = %hash, "document pushed");
        self.pushed.insert(target, hash);
        Ok(true)
    }
}
