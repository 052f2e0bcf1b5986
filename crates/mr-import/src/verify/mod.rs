//! Post-transfer integrity checks.
//!
//! Only the row count is compared; payloads are never read back. Tables that
//! were sorted at the source are sorted again at the destination, since
//! parallel appends do not preserve order.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cluster::DestinationCluster;
use crate::error::{ImportError, Result};

/// What verification found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub destination: String,
    pub row_count: u64,
    /// Whether the destination was sorted.
    pub sorted: bool,
}

/// Columns a sorted source table is re-sorted by, in order.
pub const SORT_COLUMNS: [&str; 2] = ["key", "subkey"];

/// Checks a destination table after its transfer.
pub struct IntegrityVerifier {
    cluster: Arc<dyn DestinationCluster>,
    pool: String,
}

impl IntegrityVerifier {
    pub fn new(cluster: Arc<dyn DestinationCluster>, pool: impl Into<String>) -> Self {
        Self {
            cluster,
            pool: pool.into(),
        }
    }

    /// Check the row count of `table`'s destination, then sort it if the
    /// source was sorted.
    pub async fn verify(
        &self,
        table: &str,
        destination: &str,
        expected_count: u64,
        expected_sorted: bool,
    ) -> Result<VerifyReport> {
        let row_count = self.check_count(table, destination, expected_count).await?;
        if expected_sorted {
            self.sort(table, destination).await?;
        }

        Ok(VerifyReport {
            destination: destination.to_string(),
            row_count,
            sorted: expected_sorted,
        })
    }

    /// Fail with [`ImportError::CountMismatch`] unless the destination holds
    /// exactly `expected` rows.
    pub async fn check_count(&self, table: &str, destination: &str, expected: u64) -> Result<u64> {
        let actual = self.cluster.row_count(destination).await?;
        if actual != expected {
            return Err(ImportError::CountMismatch {
                table: table.to_string(),
                expected,
                actual,
            });
        }
        debug!("{}: {} rows in {} (match)", table, actual, destination);
        Ok(actual)
    }

    /// Sort the destination in place by [`SORT_COLUMNS`].
    pub async fn sort(&self, table: &str, destination: &str) -> Result<()> {
        info!("Sorting {} by {:?}", destination, SORT_COLUMNS);
        let sort_by: Vec<String> = SORT_COLUMNS.iter().map(|c| c.to_string()).collect();
        self.cluster
            .sort(destination, &sort_by, &self.pool)
            .await
            .map_err(|e| ImportError::sort(table, e.to_string()))
    }
}
