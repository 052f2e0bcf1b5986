//! # mr-import
//!
//! Partitioned import of large tables from a legacy MapReduce cluster into a
//! destination table store.
//!
//! A table is split into contiguous record ranges, moved by a job engine
//! using one of two strategies, and checked afterwards:
//!
//! - **Pull**: workers read their ranges from source endpoints and append
//!   them to the destination
//! - **Push**: a source-side job streams the table through a bridging writer
//! - **Verification** of the destination row count, with a re-sort for
//!   tables that were sorted at the source
//! - **Rollback** of the destination when anything after its creation fails
//! - **Resume capability** via JSON state files
//!
//! ## Example
//!
//! ```rust,no_run
//! use mr_import::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mr_import::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::connect(config, CancellationToken::new())?;
//!     let tables = vec!["logs/2013-06-01".to_string()];
//!     let report = orchestrator.run(&tables, None).await?;
//!     println!("Imported {} rows", report.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metadata;
pub mod orchestrator;
pub mod partition;
pub mod records;
pub mod state;
pub mod transfer;
pub mod verify;

// Re-exports for convenient access
pub use cluster::{DestinationCluster, HttpCluster};
pub use config::{Config, DestinationConfig, ImportConfig, SourceConfig};
pub use error::{ImportError, Result};
pub use jobs::{JobEngine, JobHandle, JobOutcome, JobStats, LocalJobEngine, TransferJobSpec};
pub use metadata::{HttpMetadataProvider, MetadataProvider, TableDescriptor};
pub use orchestrator::{
    BatchReport, MigrationPhase, MigrationResult, Orchestrator, Outcome, TableImport, TablePlan,
    ValidationRow,
};
pub use partition::{partition, TransferRange};
pub use state::ImportState;
pub use transfer::{ImportStrategy, TransferDispatcher};
pub use verify::{IntegrityVerifier, VerifyReport};
