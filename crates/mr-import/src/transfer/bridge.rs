//! Local copies of the bridging writer binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::info;

use crate::cluster::DestinationCluster;
use crate::error::Result;

/// Resolves the bridging writer to a local path, downloading it at most once
/// per remote path for the lifetime of the cache.
///
/// Concurrent callers for the same remote path wait on a single download. A
/// failed download is not cached; the next caller tries again.
#[derive(Debug)]
pub struct BridgeBinaryCache {
    cache_dir: PathBuf,
    entries: Mutex<HashMap<String, Arc<OnceCell<PathBuf>>>>,
}

impl BridgeBinaryCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Local path of the bridging writer. `configured` wins when set.
    pub async fn resolve(
        &self,
        cluster: &dyn DestinationCluster,
        configured: Option<&Path>,
        remote_path: &str,
    ) -> Result<PathBuf> {
        if let Some(path) = configured {
            return Ok(path.to_path_buf());
        }

        let cell = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(remote_path.to_string())
            .or_default()
            .clone();

        let path = cell
            .get_or_try_init(|| async {
                let local = self.cache_dir.join(basename(remote_path));
                info!("Fetching bridging writer {} to {}", remote_path, local.display());
                cluster.download_file(remote_path, &local).await?;
                Ok::<_, crate::error::ImportError>(local)
            })
            .await?;
        Ok(path.clone())
    }
}

/// Last component of a `/`-separated path.
pub(crate) fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}
