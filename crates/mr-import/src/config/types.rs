//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

use crate::error::{ImportError, Result};

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Legacy source cluster.
    pub source: SourceConfig,

    /// Destination cluster.
    pub destination: DestinationConfig,

    /// Import behavior configuration.
    #[serde(default)]
    pub import: ImportConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.import = self.import.with_auto_tuning(&resources);
        self
    }
}

/// Legacy source cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source server host.
    pub server: String,

    /// Execution port used by the legacy binary (default: 8013).
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// HTTP port for the debug page and proxy reads (default: 13013).
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Load-balanced HTTP read proxies. When empty, ranges are read with the
    /// legacy binary straight from `server:server_port`.
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Route reads and writes over the alternate (fastbone) network.
    #[serde(default)]
    pub alternate_network: bool,

    /// Local path to the legacy execution binary (default: "./mapreduce").
    #[serde(default = "default_legacy_binary")]
    pub legacy_binary: PathBuf,
}

/// Destination cluster configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// HTTP proxy URL of the destination cluster.
    pub proxy: String,

    /// Destination directory; each table lands at `{root}/{table}`.
    pub root: String,

    /// OAuth token for the destination proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Remove an existing destination table before importing.
    #[serde(default)]
    pub force: bool,

    /// Server the bridging writer talks to from inside push jobs.
    /// Defaults to the host of `proxy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_server: Option<String>,

    /// Writer server used when `source.alternate_network` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate_writer_server: Option<String>,

    /// Local copy of the bridging writer binary. Fetched from
    /// `bridge_remote_path` when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_binary: Option<PathBuf>,

    /// Cypress path of the bridging writer binary.
    #[serde(default = "default_bridge_remote_path")]
    pub bridge_remote_path: String,

    /// Directory the fetched bridging writer is stored in (default: ".").
    #[serde(default = "default_bridge_cache_dir")]
    pub bridge_cache_dir: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            server_port: default_server_port(),
            http_port: default_http_port(),
            proxies: Vec::new(),
            alternate_network: false,
            legacy_binary: default_legacy_binary(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            proxy: String::new(),
            root: String::new(),
            token: None,
            force: false,
            writer_server: None,
            alternate_writer_server: None,
            bridge_binary: None,
            bridge_remote_path: default_bridge_remote_path(),
            bridge_cache_dir: default_bridge_cache_dir(),
        }
    }
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("proxy", &self.proxy)
            .field("root", &self.root)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("force", &self.force)
            .field("writer_server", &self.writer_server)
            .field("alternate_writer_server", &self.alternate_writer_server)
            .field("bridge_binary", &self.bridge_binary)
            .field("bridge_remote_path", &self.bridge_remote_path)
            .field("bridge_cache_dir", &self.bridge_cache_dir)
            .finish()
    }
}

impl DestinationConfig {
    /// Server the bridging writer should target.
    ///
    /// On the alternate network only `alternate_writer_server` is accepted;
    /// the regular writer would route traffic off the fastbone.
    pub fn effective_writer_server(&self, alternate_network: bool) -> Result<String> {
        if alternate_network {
            return self.alternate_writer_server.clone().ok_or_else(|| {
                ImportError::Config(
                    "destination.alternate_writer_server is required when source.alternate_network is set"
                        .into(),
                )
            });
        }
        if let Some(server) = &self.writer_server {
            return Ok(server.clone());
        }
        Ok(url::Url::parse(&self.proxy)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.proxy.clone()))
    }

    /// Destination path for a source table.
    pub fn table_path(&self, table: &str) -> String {
        format!(
            "{}/{}",
            self.root.trim_end_matches('/'),
            table.trim_start_matches('/')
        )
    }
}

/// Import behavior configuration.
/// Performance fields use Option<T> to distinguish between "not set"
/// (auto-tuned or derived per table) and "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Transfer strategy name: "pull" or "push".
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Maximum records per range (default: 5,000,000).
    #[serde(default = "default_record_threshold")]
    pub record_threshold: u64,

    /// Number of transfer jobs. Derived per table from the range count if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_count: Option<usize>,

    /// Total write rate limit in MB/s for push imports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_limit_mb: Option<u64>,

    /// Compression codec for the destination table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,

    /// Compute pool for transfer jobs (default: "restricted").
    #[serde(default = "default_pool")]
    pub pool: String,

    /// Log every fetch command issued by workers.
    #[serde(default)]
    pub debug: bool,

    /// Tables imported concurrently. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tables: Option<usize>,

    /// Concurrent range fetches run by the local job engine. Auto-tuned from CPU cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_workers: Option<usize>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            record_threshold: default_record_threshold(),
            job_count: None,
            speed_limit_mb: None,
            codec: None,
            pool: default_pool(),
            debug: false,
            parallel_tables: None,
            local_workers: None,
        }
    }
}

impl ImportConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Range fetches are network bound, so allow two per core.
        if self.local_workers.is_none() {
            let workers = (resources.cpu_cores * 2).clamp(2, 64);
            self.local_workers = Some(workers);
        }

        info!(
            "Auto-tuned config: local_workers={}, parallel_tables={}",
            self.get_local_workers(),
            self.get_parallel_tables(),
        );

        self
    }

    /// Job count for a table split into `ranges` pieces.
    pub fn job_count_for(&self, ranges: usize) -> usize {
        self.job_count.unwrap_or(ranges).max(1)
    }

    pub fn get_parallel_tables(&self) -> usize {
        self.parallel_tables.unwrap_or(1)
    }

    pub fn get_local_workers(&self) -> usize {
        self.local_workers.unwrap_or(8)
    }
}

// Default value functions for serde
fn default_server_port() -> u16 {
    8013
}

fn default_http_port() -> u16 {
    13013
}

fn default_legacy_binary() -> PathBuf {
    PathBuf::from("./mapreduce")
}

fn default_bridge_remote_path() -> String {
    "//home/files/mapreduce-yt".to_string()
}

fn default_bridge_cache_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_strategy() -> String {
    "pull".to_string()
}

fn default_record_threshold() -> u64 {
    5_000_000
}

fn default_pool() -> String {
    "restricted".to_string()
}
