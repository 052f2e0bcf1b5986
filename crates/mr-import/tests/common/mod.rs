//! Deterministic in-memory stand-ins for the clusters and the job engine.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use mr_import::cluster::DestinationCluster;
use mr_import::error::{ImportError, Result};
use mr_import::jobs::{JobEngine, JobHandle, JobKind, JobOutcome, JobStats, TransferJobSpec};
use mr_import::metadata::MetadataProvider;
use mr_import::partition::TransferRange;
use mr_import::records::{decode_all, encode_records, Record, RecordFormat};
use mr_import::Config;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const ROOT: &str = "//home/imported";

/// Config with small ranges and no proxies.
pub fn config() -> Config {
    let mut config = Config::from_yaml(
        r#"
source:
  server: mr-source.example.net
destination:
  proxy: http://dest-proxy.example.net
  root: //home/imported
import:
  record_threshold: 10
"#,
    )
    .unwrap();
    config.import.local_workers = Some(4);
    config
}

pub fn destination(table: &str) -> String {
    format!("{}/{}", ROOT, table)
}

/// Generated records for `[start, end)` of `table`.
pub fn records(table: &str, start: u64, end: u64) -> Bytes {
    let records: Vec<Record> = (start..end)
        .map(|i| Record::new(format!("{}:{:08}", table, i), "", format!("value-{}", i)))
        .collect();
    encode_records(RecordFormat::with_subkey(), &records)
}

#[derive(Default)]
struct ClusterState {
    tables: HashMap<String, u64>,
    files: HashMap<String, Vec<u8>>,
    created: Vec<String>,
    removed: Vec<String>,
    sorts: Vec<(String, Vec<String>, String)>,
    downloads: usize,
    fail_sort: bool,
    fail_remove: bool,
}

/// Destination cluster held in memory. Appends are decoded to count rows.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_table(self: Arc<Self>, path: &str, rows: u64) -> Arc<Self> {
        self.state.lock().unwrap().tables.insert(path.to_string(), rows);
        self
    }

    pub fn with_file(self: Arc<Self>, path: &str, content: &[u8]) -> Arc<Self> {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_vec());
        self
    }

    pub fn fail_sort(&self) {
        self.state.lock().unwrap().fail_sort = true;
    }

    pub fn fail_remove(&self) {
        self.state.lock().unwrap().fail_remove = true;
    }

    pub fn has(&self, path: &str) -> bool {
        self.state.lock().unwrap().tables.contains_key(path)
    }

    pub fn rows(&self, path: &str) -> Option<u64> {
        self.state.lock().unwrap().tables.get(path).copied()
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    /// (path, sort_by, pool) of every sort requested.
    pub fn sorts(&self) -> Vec<(String, Vec<String>, String)> {
        self.state.lock().unwrap().sorts.clone()
    }

    pub fn downloads(&self) -> usize {
        self.state.lock().unwrap().downloads
    }
}

#[async_trait]
impl DestinationCluster for MemoryCluster {
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.has(path))
    }

    async fn create_table(&self, path: &str, _recursive: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.tables.contains_key(path) {
            return Err(ImportError::Destination(format!("{} already exists", path)));
        }
        state.tables.insert(path.to_string(), 0);
        state.created.push(path.to_string());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove {
            return Err(ImportError::Destination(format!("remove {}: access denied", path)));
        }
        state.tables.remove(path);
        state.removed.push(path.to_string());
        Ok(())
    }

    async fn row_count(&self, path: &str) -> Result<u64> {
        self.rows(path)
            .ok_or_else(|| ImportError::Destination(format!("{} does not exist", path)))
    }

    async fn append(
        &self,
        path: &str,
        format: RecordFormat,
        _codec: Option<&str>,
        data: Bytes,
    ) -> Result<()> {
        let appended = decode_all(format, &data)?.len() as u64;
        let mut state = self.state.lock().unwrap();
        let rows = state
            .tables
            .get_mut(path)
            .ok_or_else(|| ImportError::Destination(format!("{} does not exist", path)))?;
        *rows += appended;
        Ok(())
    }

    async fn sort(&self, path: &str, sort_by: &[String], pool: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sort {
            return Err(ImportError::Destination(format!("operation sort {} failed", path)));
        }
        state
            .sorts
            .push((path.to_string(), sort_by.to_vec(), pool.to_string()));
        Ok(())
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let content = {
            let mut state = self.state.lock().unwrap();
            state.downloads += 1;
            state
                .files
                .get(remote_path)
                .cloned()
                .ok_or_else(|| ImportError::Destination(format!("{} does not exist", remote_path)))?
        };
        std::fs::write(local_path, content)?;
        Ok(())
    }

    fn cluster_type(&self) -> &'static str {
        "memory"
    }
}

/// Source metadata answered from a fixed table list.
#[derive(Default)]
pub struct FakeMetadata {
    tables: HashMap<String, (u64, bool)>,
}

impl FakeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, count: u64, sorted: bool) -> Self {
        self.tables.insert(name.to_string(), (count, sorted));
        self
    }

    pub fn count(&self, table: &str) -> u64 {
        self.tables.get(table).map(|(count, _)| *count).unwrap_or(0)
    }

    fn lookup(&self, table: &str) -> Result<(u64, bool)> {
        self.tables
            .get(table)
            .copied()
            .ok_or_else(|| ImportError::metadata(table, "no such table"))
    }
}

#[async_trait]
impl MetadataProvider for FakeMetadata {
    async fn record_count(&self, table: &str) -> Result<u64> {
        Ok(self.lookup(table)?.0)
    }

    async fn is_sorted(&self, table: &str) -> Result<bool> {
        Ok(self.lookup(table)?.1)
    }

    async fn is_empty(&self, table: &str) -> Result<bool> {
        Ok(self.lookup(table)?.0 == 0)
    }

    fn provider_type(&self) -> &'static str {
        "fake"
    }
}

/// Runs each job to completion inside `submit`, one range after another.
pub struct SequentialEngine {
    cluster: Arc<MemoryCluster>,
    source: Arc<FakeMetadata>,
    failing: Mutex<HashSet<String>>,
    short_by: Mutex<HashMap<String, u64>>,
    submitted: Mutex<Vec<TransferJobSpec>>,
}

impl SequentialEngine {
    pub fn new(cluster: Arc<MemoryCluster>, source: Arc<FakeMetadata>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            source,
            failing: Mutex::new(HashSet::new()),
            short_by: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
        })
    }

    /// Jobs for `table` write their first range, then fail.
    pub fn fail_table(&self, table: &str) {
        self.failing.lock().unwrap().insert(table.to_string());
    }

    /// Jobs for `table` silently drop `records` records from the last range.
    pub fn lose_records(&self, table: &str, records: u64) {
        self.short_by.lock().unwrap().insert(table.to_string(), records);
    }

    pub fn submitted(&self) -> Vec<TransferJobSpec> {
        self.submitted.lock().unwrap().clone()
    }

    async fn execute(&self, spec: &TransferJobSpec) -> JobOutcome {
        let ranges: Vec<(u64, u64)> = match &spec.kind {
            JobKind::Pull { assignments, .. } => match assignments
                .lines()
                .map(TransferRange::parse_assignment_line)
                .collect::<Result<Vec<_>>>()
            {
                Ok(ranges) => ranges.into_iter().map(|r| (r.start, r.end)).collect(),
                Err(e) => return JobOutcome::Failed(e.to_string()),
            },
            JobKind::Push { .. } => vec![(0, self.source.count(&spec.table))],
        };
        let failing = self.failing.lock().unwrap().contains(&spec.table);
        let short_by = self.short_by.lock().unwrap().get(&spec.table).copied().unwrap_or(0);

        let mut stats = JobStats::default();
        let last = ranges.len().saturating_sub(1);
        for (i, (start, mut end)) in ranges.into_iter().enumerate() {
            if i == last {
                end -= short_by;
            }
            let data = records(&spec.table, start, end);
            if let Err(e) = self
                .cluster
                .append(&spec.destination, spec.format, spec.codec.as_deref(), data)
                .await
            {
                return JobOutcome::Failed(e.to_string());
            }
            stats.ranges_completed += 1;
            stats.records += end - start;

            if failing {
                return JobOutcome::Failed(format!("worker for range [{}, {}) lost its endpoint", start, end));
            }
        }
        JobOutcome::Succeeded(stats)
    }
}

#[async_trait]
impl JobEngine for SequentialEngine {
    async fn submit(&self, spec: TransferJobSpec) -> Result<JobHandle> {
        let id = {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(spec.clone());
            format!("seq-{}", submitted.len())
        };
        let (handle, tx) = JobHandle::new(id, CancellationToken::new());
        let _ = tx.send(self.execute(&spec).await);
        Ok(handle)
    }

    fn engine_type(&self) -> &'static str {
        "sequential"
    }
}
