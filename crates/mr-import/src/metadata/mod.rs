//! Source table metadata.
//!
//! The importer needs three facts about a source table before it can plan a
//! transfer: how many records it has, whether it is sorted, and whether it is
//! empty. [`MetadataProvider`] answers them; [`HttpMetadataProvider`] scrapes
//! the legacy cluster's diagnostic page.

mod http;

pub use http::{parse_is_empty, parse_is_sorted, parse_record_count, HttpMetadataProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Snapshot of a source table taken at the start of its import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Source table name.
    pub name: String,
    /// Endpoints ranges of this table are read from.
    pub endpoints: Vec<String>,
    /// Number of records.
    pub record_count: u64,
    /// Whether the source keeps the table sorted by key and subkey.
    pub is_sorted: bool,
    /// Whether the source reports the table as empty.
    pub is_empty: bool,
}

impl TableDescriptor {
    /// A table with nothing to transfer.
    pub fn has_no_records(&self) -> bool {
        self.is_empty || self.record_count == 0
    }
}

/// Answers metadata queries about source tables.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Number of records in the table.
    async fn record_count(&self, table: &str) -> Result<u64>;

    /// Whether the table is sorted.
    async fn is_sorted(&self, table: &str) -> Result<bool>;

    /// Whether the table is empty.
    async fn is_empty(&self, table: &str) -> Result<bool>;

    /// Fetch a fresh descriptor for `table`.
    ///
    /// Empty tables are reported with a zero count without asking for the
    /// record count, which the source does not publish for them.
    async fn describe(&self, table: &str, endpoints: &[String]) -> Result<TableDescriptor> {
        let is_empty = self.is_empty(table).await?;
        let (record_count, is_sorted) = if is_empty {
            (0, false)
        } else {
            (self.record_count(table).await?, self.is_sorted(table).await?)
        };

        Ok(TableDescriptor {
            name: table.to_string(),
            endpoints: endpoints.to_vec(),
            record_count,
            is_sorted,
            is_empty,
        })
    }

    /// Provider name for logging.
    fn provider_type(&self) -> &'static str;
}
