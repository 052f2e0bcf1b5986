//! In-process job engine.
//!
//! Pull jobs run a pool of tokio workers over a shared assignment queue; each
//! worker fetches its range, checks that the payload is a complete
//! length/value stream of the expected size, and appends it to the
//! destination in bounded batches. Push jobs hand the prepared command to the
//! process launcher: the legacy cluster is the engine that runs them.

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::Client;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::fetch::{HttpRangeFetcher, LegacyRangeFetcher, RangeFetcher};
use super::process::{LaunchSpec, ProcessLauncher, TokioProcessLauncher};
use super::{FetchMethod, JobEngine, JobHandle, JobKind, JobOutcome, JobStats, TransferJobSpec};
use crate::cluster::DestinationCluster;
use crate::error::{ImportError, Result};
use crate::partition::{AssignmentQueue, CompletedRanges, TransferRange};
use crate::records::LenvalParser;

/// Appends are flushed once this many bytes of complete records are buffered.
const DEFAULT_APPEND_BATCH_BYTES: usize = 16 * 1024 * 1024;

/// Runs jobs inside the current process.
pub struct LocalJobEngine {
    cluster: Arc<dyn DestinationCluster>,
    launcher: Arc<dyn ProcessLauncher>,
    http_fetcher: Arc<dyn RangeFetcher>,
    fetcher_override: Option<Arc<dyn RangeFetcher>>,
    max_workers: usize,
    append_batch_bytes: usize,
    shutdown: CancellationToken,
}

impl LocalJobEngine {
    /// `max_workers` caps concurrent range fetches per pull job.
    pub fn new(cluster: Arc<dyn DestinationCluster>, client: Client, max_workers: usize) -> Self {
        Self {
            cluster,
            launcher: Arc::new(TokioProcessLauncher),
            http_fetcher: Arc::new(HttpRangeFetcher::new(client)),
            fetcher_override: None,
            max_workers: max_workers.max(1),
            append_batch_bytes: DEFAULT_APPEND_BATCH_BYTES,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Use `fetcher` for every pull job regardless of its fetch method.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn RangeFetcher>) -> Self {
        self.fetcher_override = Some(fetcher);
        self
    }

    /// Jobs are cancelled when `token` is.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_append_batch_bytes(mut self, bytes: usize) -> Self {
        self.append_batch_bytes = bytes.max(1);
        self
    }

    /// Cancel every running job.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn fetcher_for(&self, method: &FetchMethod) -> Arc<dyn RangeFetcher> {
        if let Some(fetcher) = &self.fetcher_override {
            return fetcher.clone();
        }
        match method {
            FetchMethod::Http => self.http_fetcher.clone(),
            FetchMethod::LegacyBinary {
                binary,
                alternate_network,
            } => Arc::new(LegacyRangeFetcher::new(
                self.launcher.clone(),
                binary.clone(),
                *alternate_network,
            )),
        }
    }
}

#[async_trait]
impl JobEngine for LocalJobEngine {
    async fn submit(&self, spec: TransferJobSpec) -> Result<JobHandle> {
        let id = format!("{}-{}", spec.kind_name(), Uuid::new_v4());
        let cancel = self.shutdown.child_token();
        let (handle, tx) = JobHandle::new(id.clone(), cancel.clone());

        match &spec.kind {
            JobKind::Pull { assignments, fetch } => {
                let queue = AssignmentQueue::from_stream(assignments)?;
                let ctx = Arc::new(PullContext {
                    id,
                    fetcher: self.fetcher_for(fetch),
                    cluster: self.cluster.clone(),
                    queue,
                    completed: Mutex::new(CompletedRanges::new()),
                    append_batch_bytes: self.append_batch_bytes,
                    spec,
                });
                let max_workers = self.max_workers;
                tokio::spawn(async move {
                    let outcome = run_pull(ctx, max_workers, cancel).await;
                    let _ = tx.send(outcome);
                });
            }
            JobKind::Push { launch } => {
                let launcher = self.launcher.clone();
                let launch = launch.clone();
                let trace = spec.trace_commands;
                tokio::spawn(async move {
                    let outcome = run_push(&id, launcher, launch, trace, cancel).await;
                    let _ = tx.send(outcome);
                });
            }
        }

        Ok(handle)
    }

    fn engine_type(&self) -> &'static str {
        "local"
    }
}

/// State shared by the workers of one pull job.
struct PullContext {
    id: String,
    spec: TransferJobSpec,
    fetcher: Arc<dyn RangeFetcher>,
    cluster: Arc<dyn DestinationCluster>,
    queue: AssignmentQueue,
    completed: Mutex<CompletedRanges>,
    append_batch_bytes: usize,
}

#[derive(Debug, Default)]
struct WorkerStats {
    ranges: usize,
    records: u64,
    bytes: u64,
}

async fn run_pull(ctx: Arc<PullContext>, max_workers: usize, cancel: CancellationToken) -> JobOutcome {
    let started = Instant::now();
    let total = ctx.queue.remaining();
    let workers = ctx.spec.job_count.min(max_workers).min(total).max(1);
    info!(
        "{}: pulling {} ranges of {} into {} with {} workers",
        ctx.id, total, ctx.spec.table, ctx.spec.destination, workers
    );

    // Tripped by the first failing worker so the others stop early.
    let abort = cancel.child_token();
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let ctx = ctx.clone();
        let abort = abort.clone();
        handles.push(tokio::spawn(async move {
            let result = pull_worker(&ctx, worker_id, &abort).await;
            if result.is_err() {
                abort.cancel();
            }
            result
        }));
    }

    let mut stats = JobStats::default();
    let mut first_error: Option<String> = None;
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok(Ok(worker)) => {
                stats.ranges_completed += worker.ranges;
                stats.records += worker.records;
                stats.bytes += worker.bytes;
            }
            Ok(Err(ImportError::Cancelled)) => {}
            Ok(Err(ImportError::Transfer { message, .. })) => {
                first_error.get_or_insert(message);
            }
            Ok(Err(e)) => {
                first_error.get_or_insert(e.to_string());
            }
            Err(e) => {
                first_error.get_or_insert(format!("worker panicked: {}", e));
            }
        }
    }
    stats.duration = started.elapsed();

    if let Some(message) = first_error {
        let (reached, covered) = {
            let completed = ctx
                .completed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (completed.contiguous_end(), completed.covered())
        };
        warn!(
            "{}: failed after records [0, {}) were complete ({} records in all)",
            ctx.id, reached, covered
        );
        return JobOutcome::Failed(message);
    }
    if cancel.is_cancelled() {
        info!("{}: cancelled", ctx.id);
        return JobOutcome::Cancelled;
    }

    info!(
        "{}: {} records ({} bytes) in {:.1}s",
        ctx.id,
        stats.records,
        stats.bytes,
        stats.duration.as_secs_f64()
    );
    JobOutcome::Succeeded(stats)
}

async fn pull_worker(ctx: &PullContext, worker_id: usize, abort: &CancellationToken) -> Result<WorkerStats> {
    let mut stats = WorkerStats::default();
    loop {
        if abort.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        let Some(range) = ctx.queue.next_assignment() else {
            break;
        };

        if ctx.spec.trace_commands {
            info!(
                "{} worker {}: {}",
                ctx.id,
                worker_id,
                ctx.fetcher.describe(&ctx.spec.table, &range)
            );
        } else {
            debug!("{} worker {}: {}", ctx.id, worker_id, range);
        }

        let (records, bytes) = transfer_range(ctx, &range, abort).await?;
        ctx.completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .add(&range);

        stats.ranges += 1;
        stats.records += records;
        stats.bytes += bytes;
    }
    Ok(stats)
}

/// Fetch one range and append it. Returns (records, bytes).
async fn transfer_range(
    ctx: &PullContext,
    range: &TransferRange,
    abort: &CancellationToken,
) -> Result<(u64, u64)> {
    let spec = &ctx.spec;
    let codec = spec.codec.as_deref();
    let mut rx = ctx.fetcher.fetch(&spec.table, range);
    let mut parser = LenvalParser::new(spec.format);
    let mut batch = BytesMut::new();
    let mut records = 0u64;
    let mut bytes = 0u64;

    loop {
        let chunk = tokio::select! {
            _ = abort.cancelled() => return Err(ImportError::Cancelled),
            chunk = rx.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };

        parser.extend(&chunk?);
        while let Some(frame) = parser
            .next_frame()
            .map_err(|e| ImportError::transfer(&spec.table, format!("range {}: {}", range, e)))?
        {
            batch.extend_from_slice(&frame);
            records += 1;
        }

        if batch.len() >= ctx.append_batch_bytes {
            bytes += batch.len() as u64;
            ctx.cluster
                .append(&spec.destination, spec.format, codec, batch.split().freeze())
                .await?;
        }
    }

    if parser.buffered_len() > 0 {
        return Err(ImportError::transfer(
            &spec.table,
            format!(
                "range {}: record stream truncated with {} bytes left over",
                range,
                parser.buffered_len()
            ),
        ));
    }
    if records != range.len() {
        return Err(ImportError::transfer(
            &spec.table,
            format!("range {}: received {} records, expected {}", range, records, range.len()),
        ));
    }

    if !batch.is_empty() {
        bytes += batch.len() as u64;
        ctx.cluster
            .append(&spec.destination, spec.format, codec, batch.freeze())
            .await?;
    }
    Ok((records, bytes))
}

async fn run_push(
    id: &str,
    launcher: Arc<dyn ProcessLauncher>,
    launch: LaunchSpec,
    trace: bool,
    cancel: CancellationToken,
) -> JobOutcome {
    let started = Instant::now();
    if trace {
        info!("{}: {}", id, launch);
    } else {
        info!("{}: launching {}", id, launch.program.display());
    }

    match launcher.run(&launch, &cancel).await {
        Ok(()) => {
            info!("{}: finished in {:.1}s", id, started.elapsed().as_secs_f64());
            JobOutcome::Succeeded(JobStats {
                duration: started.elapsed(),
                ..JobStats::default()
            })
        }
        Err(ImportError::Cancelled) => JobOutcome::Cancelled,
        Err(e) => JobOutcome::Failed(e.to_string()),
    }
}
