//! Transfer jobs and the engine that runs them.
//!
//! The importer never runs transfers itself: it builds a [`TransferJobSpec`],
//! submits it to a [`JobEngine`] and waits on the returned [`JobHandle`].
//! Scheduling, worker parallelism and retries belong to the engine.

mod fetch;
mod local;
mod process;

pub use fetch::{HttpRangeFetcher, LegacyRangeFetcher, RangeFetcher};
pub use local::LocalJobEngine;
pub use process::{shell_quote, LaunchSpec, ProcessLauncher, TokioProcessLauncher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::records::RecordFormat;

/// How pull workers read their ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMethod {
    /// HTTP read proxies.
    Http,
    /// The legacy binary, run against the execution endpoint.
    LegacyBinary {
        binary: PathBuf,
        alternate_network: bool,
    },
}

/// What a job does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// Workers claim lines of the work-assignment stream, fetch each range
    /// and append it to the destination.
    Pull {
        assignments: String,
        fetch: FetchMethod,
    },
    /// A source-side job streams the whole table into the destination
    /// through the bridging writer.
    Push { launch: LaunchSpec },
}

/// Everything an engine needs to run one table's transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJobSpec {
    /// Source table.
    pub table: String,
    /// Destination table path.
    pub destination: String,
    pub kind: JobKind,
    pub format: RecordFormat,
    pub codec: Option<String>,
    pub pool: String,
    pub job_count: usize,
    /// Per-worker write limit in bytes per second.
    pub rate_limit: Option<u64>,
    /// Log every fetch command.
    pub trace_commands: bool,
}

impl TransferJobSpec {
    /// Number of lines in the work-assignment stream (0 for push jobs).
    pub fn assignment_count(&self) -> usize {
        match &self.kind {
            JobKind::Pull { assignments, .. } => {
                assignments.lines().filter(|l| !l.trim().is_empty()).count()
            }
            JobKind::Push { .. } => 0,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            JobKind::Pull { .. } => "pull",
            JobKind::Push { .. } => "push",
        }
    }
}

/// Counters reported by a finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub ranges_completed: usize,
    pub records: u64,
    pub bytes: u64,
    pub duration: Duration,
}

/// Terminal state of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded(JobStats),
    Failed(String),
    Cancelled,
}

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    /// Create a handle and the sender the engine reports the outcome on.
    pub fn new(id: impl Into<String>, cancel: CancellationToken) -> (Self, oneshot::Sender<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            id: id.into(),
            cancel,
            outcome: rx,
        };
        (handle, tx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cancellation. The job still reports an outcome.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the job finishes.
    pub async fn wait(self) -> JobOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| JobOutcome::Failed(format!("job {} was dropped by its engine", self.id)))
    }
}

/// Runs transfer jobs.
#[async_trait]
pub trait JobEngine: Send + Sync {
    /// Accept a job. Errors here mean the job was never started.
    async fn submit(&self, spec: TransferJobSpec) -> Result<JobHandle>;

    /// Engine name for logging.
    fn engine_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_reports_outcome() {
        let (handle, tx) = JobHandle::new("job-1", CancellationToken::new());
        tx.send(JobOutcome::Cancelled).unwrap();
        assert_eq!(handle.wait().await, JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_failure() {
        let (handle, tx) = JobHandle::new("job-2", CancellationToken::new());
        drop(tx);
        match handle.wait().await {
            JobOutcome::Failed(msg) => assert!(msg.contains("job-2")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cancel_trips_token() {
        let token = CancellationToken::new();
        let (handle, _tx) = JobHandle::new("job-3", token.clone());
        assert_eq!(handle.id(), "job-3");
        handle.cancel();
        assert!(token.is_cancelled());
    }
}
