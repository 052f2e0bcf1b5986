//! Import orchestrator - per-table state machine and batch driver.
//!
//! Each table moves through
//! `pending -> metadata_fetched -> destination_created -> transferring ->
//! verifying -> (sorting) -> completed`. Any failure after the destination
//! was created removes it before the error is reported. Failures are caught
//! per table, so one bad table never stops the rest of a batch.

mod rollback;

pub use rollback::RollbackManager;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{DestinationCluster, HttpCluster};
use crate::config::Config;
use crate::error::{ImportError, Result};
use crate::jobs::{JobEngine, JobStats, LocalJobEngine};
use crate::metadata::{HttpMetadataProvider, MetadataProvider, TableDescriptor};
use crate::partition::{partition, TransferRange};
use crate::state::{ImportState, RunStatus};
use crate::transfer::{ImportStrategy, TransferDispatcher};
use crate::verify::{IntegrityVerifier, VerifyReport};

/// Phases of one table's import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Pending,
    MetadataFetched,
    DestinationCreated,
    Transferring,
    Verifying,
    Sorting,
    Completed,
    Failed,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationPhase::Pending => "pending",
            MigrationPhase::MetadataFetched => "metadata_fetched",
            MigrationPhase::DestinationCreated => "destination_created",
            MigrationPhase::Transferring => "transferring",
            MigrationPhase::Verifying => "verifying",
            MigrationPhase::Sorting => "sorting",
            MigrationPhase::Completed => "completed",
            MigrationPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Final outcome of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

/// Per-table result handed back to the batch driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Source table.
    pub table: String,

    pub outcome: Outcome,

    /// Rows in the destination after verification (0 on failure).
    pub transferred_count: u64,

    /// Error message if failed.
    pub error: Option<String>,

    /// Destination path, if one was created.
    pub destination: Option<String>,

    /// Phase the import was in when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_during: Option<MigrationPhase>,

    /// Whether the destination was removed after a failure.
    pub rolled_back: bool,

    pub duration_seconds: f64,
}

/// Details of a successful table import.
#[derive(Debug, Clone)]
pub struct TableImport {
    pub descriptor: TableDescriptor,
    pub destination: String,
    pub strategy: ImportStrategy,
    pub range_count: usize,
    pub stats: JobStats,
    pub report: VerifyReport,
}

/// Result of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the batch started.
    pub started_at: DateTime<Utc>,

    /// When the batch completed.
    pub completed_at: DateTime<Utc>,

    /// Tables requested.
    pub tables_total: usize,

    /// Tables imported in this run.
    pub tables_completed: usize,

    /// Tables that failed.
    pub tables_failed: usize,

    /// Tables skipped because a previous run completed them.
    pub tables_skipped: usize,

    /// Tables never started because the batch was cancelled.
    pub tables_cancelled: usize,

    /// Total rows transferred.
    pub rows_transferred: u64,

    /// List of failed table names.
    pub failed_tables: Vec<String>,

    /// Per-table results, in request order.
    pub results: Vec<MigrationResult>,
}

impl BatchReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Range plan for one table, computed without touching the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePlan {
    pub table: String,
    pub destination: String,
    pub strategy: String,
    pub record_count: u64,
    pub is_sorted: bool,
    pub job_count: usize,
    /// Empty for tables with no records, which would be skipped.
    pub ranges: Vec<TransferRange>,
}

/// Row count comparison between a source table and its destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRow {
    pub table: String,
    pub destination: String,
    pub source_count: u64,
    /// `None` when the destination does not exist.
    pub destination_count: Option<u64>,
    pub matches: bool,
}

/// Tracks where one table's import has got to.
struct Progress<'a> {
    table: &'a str,
    phase: MigrationPhase,
    destination: Option<String>,
    rolled_back: bool,
}

impl<'a> Progress<'a> {
    fn new(table: &'a str) -> Self {
        Self {
            table,
            phase: MigrationPhase::Pending,
            destination: None,
            rolled_back: false,
        }
    }

    fn enter(&mut self, next: MigrationPhase) {
        debug!("{}: {} -> {}", self.table, self.phase, next);
        self.phase = next;
    }
}

/// Import orchestrator.
pub struct Orchestrator {
    config: Arc<Config>,
    metadata: Arc<dyn MetadataProvider>,
    cluster: Arc<dyn DestinationCluster>,
    dispatcher: TransferDispatcher,
    verifier: IntegrityVerifier,
    rollback: RollbackManager,
    state_file: Option<PathBuf>,
    state: Option<ImportState>,
}

impl Orchestrator {
    /// Create an orchestrator over the given capabilities.
    pub fn new(
        config: Config,
        metadata: Arc<dyn MetadataProvider>,
        cluster: Arc<dyn DestinationCluster>,
        engine: Arc<dyn JobEngine>,
    ) -> Self {
        let config = Arc::new(config);
        let dispatcher = TransferDispatcher::new(config.clone(), engine, cluster.clone());
        let verifier = IntegrityVerifier::new(cluster.clone(), config.import.pool.clone());
        let rollback = RollbackManager::new(cluster.clone());

        Self {
            config,
            metadata,
            cluster,
            dispatcher,
            verifier,
            rollback,
            state_file: None,
            state: None,
        }
    }

    /// Create an orchestrator talking to real clusters over HTTP, running
    /// jobs with the local engine. Jobs are cancelled when `shutdown` is.
    pub fn connect(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mr-import/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let metadata = Arc::new(HttpMetadataProvider::new(
            client.clone(),
            config.source.debug_base_url(),
        ));
        let cluster: Arc<dyn DestinationCluster> = Arc::new(HttpCluster::new(
            client.clone(),
            config.destination.proxy.clone(),
            config.destination.token.clone(),
        ));
        let engine = Arc::new(
            LocalJobEngine::new(cluster.clone(), client, config.import.get_local_workers())
                .with_shutdown_token(shutdown),
        );

        info!(
            "Source metadata via {}, destination via {}, jobs on {} engine",
            metadata.provider_type(),
            cluster.cluster_type(),
            engine.engine_type()
        );
        Ok(Self::new(config, metadata, cluster, engine))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &TransferDispatcher {
        &self.dispatcher
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Load existing state for resume.
    pub fn resume(mut self) -> Result<Self> {
        if let Some(ref path) = self.state_file {
            if path.exists() {
                let state = ImportState::load(path)?;
                state.validate_config(&self.config.hash())?;
                self.state = Some(state);
                info!("Resuming from state file: {:?}", path);
            }
        }
        Ok(self)
    }

    /// Import one table, propagating its error.
    pub async fn migrate(&self, table: &str) -> Result<TableImport> {
        let mut progress = Progress::new(table);
        self.migrate_tracked(&mut progress).await
    }

    /// Import one table, catching its error into the result.
    pub async fn import_table(&self, table: &str) -> MigrationResult {
        let started = Instant::now();
        let mut progress = Progress::new(table);
        let result = self.migrate_tracked(&mut progress).await;
        let duration_seconds = started.elapsed().as_secs_f64();

        match result {
            Ok(import) => {
                info!(
                    "{}: completed, {} rows into {} in {:.1}s",
                    table, import.report.row_count, import.destination, duration_seconds
                );
                MigrationResult {
                    table: table.to_string(),
                    outcome: Outcome::Completed,
                    transferred_count: import.report.row_count,
                    error: None,
                    destination: Some(import.destination),
                    failed_during: None,
                    rolled_back: false,
                    duration_seconds,
                }
            }
            Err(e) => {
                error!("{}: failed during {}: {}", table, progress.phase, e);
                MigrationResult {
                    table: table.to_string(),
                    outcome: Outcome::Failed,
                    transferred_count: 0,
                    error: Some(e.to_string()),
                    destination: progress.destination,
                    failed_during: Some(progress.phase),
                    rolled_back: progress.rolled_back,
                    duration_seconds,
                }
            }
        }
    }

    async fn migrate_tracked(&self, progress: &mut Progress<'_>) -> Result<TableImport> {
        let result = self.run_phases(progress).await;
        if let Err(ref e) = result {
            match progress.destination.clone() {
                Some(destination) if !e.is_pre_creation() => {
                    progress.rolled_back = self.rollback.rollback(&destination).await.is_none();
                }
                _ => debug!("{}: nothing to roll back", progress.table),
            }
        }
        result
    }

    async fn run_phases(&self, progress: &mut Progress<'_>) -> Result<TableImport> {
        let table = progress.table;
        let strategy: ImportStrategy = self.config.import.strategy.parse()?;

        let endpoints = self.config.source.read_endpoints();
        let descriptor = self.metadata.describe(table, &endpoints).await?;
        progress.enter(MigrationPhase::MetadataFetched);
        if descriptor.has_no_records() {
            return Err(ImportError::EmptyTable(table.to_string()));
        }
        info!(
            "{}: {} records, sorted={}, strategy={}",
            table, descriptor.record_count, descriptor.is_sorted, strategy
        );

        let ranges = partition(
            descriptor.record_count,
            self.config.import.record_threshold,
            &endpoints,
        )?;
        let destination = self.config.destination.table_path(table);
        self.prepare_destination(&destination).await?;
        progress.destination = Some(destination.clone());
        progress.enter(MigrationPhase::DestinationCreated);

        let (stats, report) = self
            .transfer_and_verify(progress, strategy, &descriptor, &destination, &ranges)
            .await?;
        progress.enter(MigrationPhase::Completed);

        Ok(TableImport {
            descriptor,
            destination,
            strategy,
            range_count: ranges.len(),
            stats,
            report,
        })
    }

    /// Clear the way for `destination` and create it.
    async fn prepare_destination(&self, destination: &str) -> Result<()> {
        if self.cluster.exists(destination).await? {
            if !self.config.destination.force {
                return Err(ImportError::DestinationExists(destination.to_string()));
            }
            info!("Removing existing {} (force)", destination);
            self.cluster.remove(destination).await?;
        }
        self.cluster.create_table(destination, true).await
    }

    async fn transfer_and_verify(
        &self,
        progress: &mut Progress<'_>,
        strategy: ImportStrategy,
        descriptor: &TableDescriptor,
        destination: &str,
        ranges: &[TransferRange],
    ) -> Result<(JobStats, VerifyReport)> {
        progress.enter(MigrationPhase::Transferring);
        let stats = self
            .dispatcher
            .dispatch(strategy, descriptor, destination, ranges)
            .await?;

        progress.enter(MigrationPhase::Verifying);
        let table = &descriptor.name;
        let row_count = self
            .verifier
            .check_count(table, destination, descriptor.record_count)
            .await?;

        if descriptor.is_sorted {
            progress.enter(MigrationPhase::Sorting);
            self.verifier.sort(table, destination).await?;
        }

        Ok((
            stats,
            VerifyReport {
                destination: destination.to_string(),
                row_count,
                sorted: descriptor.is_sorted,
            },
        ))
    }

    /// Import `tables`, continuing past failures.
    ///
    /// When `cancel` trips, tables that have not started yet are skipped;
    /// in-flight tables finish (or fail) on their own.
    pub async fn run(mut self, tables: &[String], cancel: Option<CancellationToken>) -> Result<BatchReport> {
        let started_at = Utc::now();
        let cancel = cancel.unwrap_or_default();
        let mut state = match self.state.take() {
            Some(state) => state,
            None => ImportState::new(uuid::Uuid::new_v4().to_string(), self.config.hash()),
        };
        let run_id = state.run_id.clone();

        let pending: Vec<&String> = tables
            .iter()
            .filter(|table| {
                let done = state.is_table_completed(table);
                if done {
                    info!("{}: already completed in run {}, skipping", table, run_id);
                }
                !done
            })
            .collect();
        let tables_skipped = tables.len() - pending.len();

        info!(
            "Starting import run {}: {} tables ({} skipped), {} at a time",
            run_id,
            pending.len(),
            tables_skipped,
            self.config.import.get_parallel_tables()
        );
        self.save_state(&mut state)?;

        let this = &self;
        let mut results_stream = futures::stream::iter(pending.into_iter().map(|table| {
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    warn!("{}: not started, batch cancelled", table);
                    return None;
                }
                Some(this.import_table(table).await)
            }
        }))
        .buffered(this.config.import.get_parallel_tables().max(1));

        let mut results = Vec::new();
        let mut tables_cancelled = 0;
        while let Some(result) = results_stream.next().await {
            match result {
                Some(result) => {
                    state.record(&result);
                    this.save_state(&mut state)?;
                    results.push(result);
                }
                None => tables_cancelled += 1,
            }
        }
        drop(results_stream);

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let mut tables_completed = 0;
        let mut rows_transferred = 0;
        let mut failed_tables = Vec::new();
        for result in &results {
            match result.outcome {
                Outcome::Completed => {
                    tables_completed += 1;
                    rows_transferred += result.transferred_count;
                }
                Outcome::Failed => failed_tables.push(result.table.clone()),
            }
        }

        let status = if !failed_tables.is_empty() {
            RunStatus::Failed
        } else if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        state.finish(status);
        self.save_state(&mut state)?;

        let report = BatchReport {
            run_id,
            status: status_name(status).to_string(),
            duration_seconds,
            started_at,
            completed_at,
            tables_total: tables.len(),
            tables_completed,
            tables_failed: failed_tables.len(),
            tables_skipped,
            tables_cancelled,
            rows_transferred,
            failed_tables,
            results,
        };

        info!(
            "Import {}: {} completed, {} failed, {} skipped, {} rows in {:.1}s",
            report.status,
            report.tables_completed,
            report.tables_failed,
            report.tables_skipped,
            report.rows_transferred,
            report.duration_seconds
        );
        Ok(report)
    }

    /// Compute each table's range plan without creating anything.
    pub async fn plan(&self, tables: &[String]) -> Result<Vec<TablePlan>> {
        let strategy: ImportStrategy = self.config.import.strategy.parse()?;
        let endpoints = self.config.source.read_endpoints();
        let mut plans = Vec::with_capacity(tables.len());

        for table in tables {
            let descriptor = self.metadata.describe(table, &endpoints).await?;
            let ranges = if descriptor.has_no_records() {
                Vec::new()
            } else {
                partition(
                    descriptor.record_count,
                    self.config.import.record_threshold,
                    &endpoints,
                )?
            };
            let job_count = if ranges.is_empty() {
                0
            } else {
                self.config.import.job_count_for(ranges.len())
            };

            plans.push(TablePlan {
                table: table.clone(),
                destination: self.config.destination.table_path(table),
                strategy: strategy.to_string(),
                record_count: descriptor.record_count,
                is_sorted: descriptor.is_sorted,
                job_count,
                ranges,
            });
        }

        Ok(plans)
    }

    /// Compare source record counts with destination row counts.
    pub async fn validate(&self, tables: &[String]) -> Result<Vec<ValidationRow>> {
        let endpoints = self.config.source.read_endpoints();
        let mut rows = Vec::with_capacity(tables.len());

        for table in tables {
            let descriptor = self.metadata.describe(table, &endpoints).await?;
            let destination = self.config.destination.table_path(table);
            let destination_count = if self.cluster.exists(&destination).await? {
                Some(self.cluster.row_count(&destination).await?)
            } else {
                None
            };
            let matches = destination_count == Some(descriptor.record_count);

            match destination_count {
                Some(count) if matches => info!("{}: {} rows (match)", table, count),
                Some(count) => warn!(
                    "{}: source={} destination={} (MISMATCH)",
                    table, descriptor.record_count, count
                ),
                None => warn!("{}: destination {} does not exist", table, destination),
            }

            rows.push(ValidationRow {
                table: table.clone(),
                destination,
                source_count: descriptor.record_count,
                destination_count,
                matches,
            });
        }

        Ok(rows)
    }

    /// Save state to file.
    fn save_state(&self, state: &mut ImportState) -> Result<()> {
        if let Some(ref path) = self.state_file {
            state.save(path)?;
        }
        Ok(())
    }
}

fn status_name(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}
