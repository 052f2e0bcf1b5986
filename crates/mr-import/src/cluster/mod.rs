//! Destination cluster access.
//!
//! [`DestinationCluster`] is the narrow slice of the destination's
//! path-addressed object API the importer depends on: table lifecycle, row
//! counts, appends, sorting, and file download. [`HttpCluster`] implements it
//! against the destination HTTP proxy.

mod http;

pub use http::HttpCluster;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::error::Result;
use crate::records::RecordFormat;

/// Operations on the destination cluster.
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// table of a batch and by all workers of a job.
#[async_trait]
pub trait DestinationCluster: Send + Sync {
    /// Check if a node exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create an empty table. Fails if the node already exists.
    async fn create_table(&self, path: &str, recursive: bool) -> Result<()>;

    /// Remove a node.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Number of rows in a table.
    async fn row_count(&self, path: &str) -> Result<u64>;

    /// Append a length/value encoded batch of complete records to a table.
    async fn append(
        &self,
        path: &str,
        format: RecordFormat,
        codec: Option<&str>,
        data: Bytes,
    ) -> Result<()>;

    /// Sort a table in place and wait for the sort to finish.
    async fn sort(&self, path: &str, sort_by: &[String], pool: &str) -> Result<()>;

    /// Download a file node to a local path.
    async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<()>;

    /// Cluster type name for logging.
    fn cluster_type(&self) -> &'static str;
}
