//! Best-effort cleanup of partially imported tables.

use std::sync::Arc;
use tracing::{info, warn};

use crate::cluster::DestinationCluster;

/// Removes destinations left behind by failed imports.
pub struct RollbackManager {
    cluster: Arc<dyn DestinationCluster>,
}

impl RollbackManager {
    pub fn new(cluster: Arc<dyn DestinationCluster>) -> Self {
        Self { cluster }
    }

    /// Delete `destination`. Never fails: a cleanup error is logged and
    /// returned as a diagnostic so the original failure stays the one
    /// reported.
    pub async fn rollback(&self, destination: &str) -> Option<String> {
        match self.cluster.remove(destination).await {
            Ok(()) => {
                info!("Rolled back {}", destination);
                None
            }
            Err(e) => {
                warn!("Rollback of {} failed: {}", destination, e);
                Some(e.to_string())
            }
        }
    }
}
