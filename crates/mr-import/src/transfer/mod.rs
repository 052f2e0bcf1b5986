//! Transfer strategies.
//!
//! [`TransferDispatcher`] turns a partitioned table into a job for the
//! [`JobEngine`] and blocks until the job finishes:
//!
//! - **pull**: destination-side workers claim ranges from the
//!   work-assignment stream, read each range from a source endpoint, and
//!   append it to the destination.
//! - **push**: one job on the source cluster streams the whole table into the
//!   destination through the bridging writer, optionally rate limited.

mod bridge;

pub use bridge::BridgeBinaryCache;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cluster::DestinationCluster;
use crate::config::Config;
use crate::error::{ImportError, Result};
use crate::jobs::{
    shell_quote, FetchMethod, JobEngine, JobKind, JobOutcome, JobStats, LaunchSpec,
    TransferJobSpec,
};
use crate::metadata::TableDescriptor;
use crate::partition::{encode_assignments, TransferRange};
use crate::records::RecordFormat;

const MIB: u64 = 1024 * 1024;

/// How records move from the source to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStrategy {
    Pull,
    Push,
}

impl FromStr for ImportStrategy {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pull" => Ok(ImportStrategy::Pull),
            "push" => Ok(ImportStrategy::Push),
            other => Err(ImportError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for ImportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportStrategy::Pull => write!(f, "pull"),
            ImportStrategy::Push => write!(f, "push"),
        }
    }
}

/// Builds transfer jobs and waits for them.
pub struct TransferDispatcher {
    config: Arc<Config>,
    engine: Arc<dyn JobEngine>,
    cluster: Arc<dyn DestinationCluster>,
    bridge: BridgeBinaryCache,
}

impl TransferDispatcher {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<dyn JobEngine>,
        cluster: Arc<dyn DestinationCluster>,
    ) -> Self {
        let bridge = BridgeBinaryCache::new(config.destination.bridge_cache_dir.clone());
        Self {
            config,
            engine,
            cluster,
            bridge,
        }
    }

    /// Transfer `table` into `destination` with `strategy`.
    pub async fn dispatch(
        &self,
        strategy: ImportStrategy,
        table: &TableDescriptor,
        destination: &str,
        ranges: &[TransferRange],
    ) -> Result<JobStats> {
        match strategy {
            ImportStrategy::Pull => self.pull(table, destination, ranges).await,
            ImportStrategy::Push => self.push(table, destination, ranges).await,
        }
    }

    /// Run a pull job over `ranges`.
    pub async fn pull(
        &self,
        table: &TableDescriptor,
        destination: &str,
        ranges: &[TransferRange],
    ) -> Result<JobStats> {
        let spec = pull_job_spec(&self.config, &table.name, destination, ranges);
        self.run(spec).await
    }

    /// Run a push job; `ranges` only sizes the job count.
    pub async fn push(
        &self,
        table: &TableDescriptor,
        destination: &str,
        ranges: &[TransferRange],
    ) -> Result<JobStats> {
        let bridge = self
            .bridge
            .resolve(
                self.cluster.as_ref(),
                self.config.destination.bridge_binary.as_deref(),
                &self.config.destination.bridge_remote_path,
            )
            .await?;
        let spec = push_job_spec(&self.config, &table.name, destination, ranges.len(), &bridge)?;
        self.run(spec).await
    }

    async fn run(&self, spec: TransferJobSpec) -> Result<JobStats> {
        let table = spec.table.clone();
        info!(
            "Submitting {} job for {} to {} engine ({} jobs, {} assignments)",
            spec.kind_name(),
            table,
            self.engine.engine_type(),
            spec.job_count,
            spec.assignment_count()
        );

        let handle = self
            .engine
            .submit(spec)
            .await
            .map_err(|e| ImportError::transfer(&table, format!("job submission failed: {}", e)))?;

        debug!("{}: waiting on job {}", table, handle.id());
        match handle.wait().await {
            JobOutcome::Succeeded(stats) => Ok(stats),
            JobOutcome::Failed(message) => Err(ImportError::transfer(&table, message)),
            JobOutcome::Cancelled => Err(ImportError::transfer(&table, "job was cancelled")),
        }
    }
}

/// Job spec for pulling `ranges` of `table` into `destination`.
pub fn pull_job_spec(
    config: &Config,
    table: &str,
    destination: &str,
    ranges: &[TransferRange],
) -> TransferJobSpec {
    let fetch = if config.source.uses_proxies() {
        FetchMethod::Http
    } else {
        FetchMethod::LegacyBinary {
            binary: config.source.legacy_binary.clone(),
            alternate_network: config.source.alternate_network,
        }
    };

    TransferJobSpec {
        table: table.to_string(),
        destination: destination.to_string(),
        kind: JobKind::Pull {
            assignments: encode_assignments(ranges),
            fetch,
        },
        format: RecordFormat::with_subkey(),
        codec: config.import.codec.clone(),
        pool: config.import.pool.clone(),
        job_count: config.import.job_count_for(ranges.len()),
        rate_limit: None,
        trace_commands: config.import.debug,
    }
}

/// Job spec for pushing `table` into `destination` through the bridging
/// writer at `bridge`.
pub fn push_job_spec(
    config: &Config,
    table: &str,
    destination: &str,
    range_count: usize,
    bridge: &Path,
) -> Result<TransferJobSpec> {
    let job_count = config.import.job_count_for(range_count);
    let rate_limit = config
        .import
        .speed_limit_mb
        .map(|mb| mb.saturating_mul(MIB) / job_count as u64);
    let codec = config.import.codec.as_deref();

    let bridge_name = bridge
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| bridge.display().to_string());
    let writer = config
        .destination
        .effective_writer_server(config.source.alternate_network)?;
    let map_command = writer_command(&bridge_name, &writer, codec, destination, rate_limit);

    let mut launch = LaunchSpec::new(&config.source.legacy_binary)
        .env("MR_USER", "tmp")
        .arg("-server")
        .arg(config.source.execution_endpoint())
        .arg("-map")
        .arg(map_command)
        .arg("-src")
        .arg(table)
        .arg("-dst")
        .arg(format!("tmp/{}", bridge::basename(table)))
        .arg("-jobcount")
        .arg(job_count.to_string())
        .args(["-lenval", "-subkey"])
        .arg("-file")
        .arg(bridge.display().to_string());
    if let Some(codec) = codec {
        launch = launch.args(["-codec", codec]);
    }

    Ok(TransferJobSpec {
        table: table.to_string(),
        destination: destination.to_string(),
        kind: JobKind::Push { launch },
        format: RecordFormat::with_subkey(),
        codec: config.import.codec.clone(),
        pool: config.import.pool.clone(),
        job_count,
        rate_limit,
        trace_commands: config.import.debug,
    })
}

/// Mapper command run by every push job on the source cluster.
fn writer_command(
    bridge_name: &str,
    writer: &str,
    codec: Option<&str>,
    destination: &str,
    rate_limit: Option<u64>,
) -> String {
    let mut command = format!(
        "YT_USE_HOSTS=1 ./{} -server {} -append -lenval -subkey",
        shell_quote(bridge_name),
        shell_quote(writer)
    );
    if let Some(codec) = codec {
        command.push_str(&format!(" -codec {}", shell_quote(codec)));
    }
    command.push_str(&format!(" -write {}", shell_quote(destination)));

    match rate_limit {
        Some(rate) => format!("pv -q -L {} | {}", rate, command),
        None => command,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition;
    use std::path::PathBuf;

    fn config() -> Config {
        Config::from_yaml(
            r#"
source:
  server: mr-source.example.net
destination:
  proxy: http://dest-proxy.example.net
  root: //home/imported
"#,
        )
        .unwrap()
    }

    fn ranges(count: u64, threshold: u64, endpoints: &[String]) -> Vec<TransferRange> {
        partition(count, threshold, endpoints).unwrap()
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("pull".parse::<ImportStrategy>().unwrap(), ImportStrategy::Pull);
        assert_eq!("push".parse::<ImportStrategy>().unwrap(), ImportStrategy::Push);
        match "sync".parse::<ImportStrategy>() {
            Err(ImportError::UnknownStrategy(s)) => assert_eq!(s, "sync"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ImportStrategy::Push.to_string(), "push");
    }

    #[test]
    fn test_pull_spec_without_proxies_uses_legacy_binary() {
        let mut config = config();
        config.source.alternate_network = true;
        let endpoints = config.source.read_endpoints();
        let spec = pull_job_spec(&config, "logs", "//home/imported/logs", &ranges(25, 10, &endpoints));

        assert_eq!(spec.job_count, 3);
        assert_eq!(spec.pool, "restricted");
        match spec.kind {
            JobKind::Pull { assignments, fetch } => {
                assert_eq!(
                    assignments,
                    "mr-source.example.net:8013\t0\t10\n\
                     mr-source.example.net:8013\t10\t20\n\
                     mr-source.example.net:8013\t20\t25\n"
                );
                assert_eq!(
                    fetch,
                    FetchMethod::LegacyBinary {
                        binary: PathBuf::from("./mapreduce"),
                        alternate_network: true
                    }
                );
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_pull_spec_with_proxies_uses_http() {
        let mut config = config();
        config.source.proxies = vec!["p1".into(), "p2".into()];
        config.import.job_count = Some(7);
        let endpoints = config.source.read_endpoints();
        let spec = pull_job_spec(&config, "logs", "//home/imported/logs", &ranges(25, 10, &endpoints));

        assert_eq!(spec.job_count, 7);
        match spec.kind {
            JobKind::Pull { assignments, fetch } => {
                assert!(assignments.starts_with("p1:13013\t0\t10\np2:13013\t10\t20\n"));
                assert_eq!(fetch, FetchMethod::Http);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_push_spec_command() {
        let mut config = config();
        config.import.speed_limit_mb = Some(100);
        config.import.codec = Some("zlib_9".into());
        let spec = push_job_spec(
            &config,
            "logs/2013-06-01",
            "//home/imported/logs/2013-06-01",
            4,
            Path::new("/tmp/cache/mapreduce-yt"),
        )
        .unwrap();

        assert_eq!(spec.job_count, 4);
        assert_eq!(spec.rate_limit, Some(100 * MIB / 4));
        let JobKind::Push { launch } = spec.kind else {
            panic!("expected push job");
        };
        assert_eq!(launch.program, PathBuf::from("./mapreduce"));
        assert_eq!(launch.env, vec![("MR_USER".to_string(), "tmp".to_string())]);
        assert_eq!(
            launch.args,
            vec![
                "-server".to_string(),
                "mr-source.example.net:8013".into(),
                "-map".into(),
                format!(
                    "pv -q -L {} | YT_USE_HOSTS=1 ./mapreduce-yt -server dest-proxy.example.net \
                     -append -lenval -subkey -codec zlib_9 -write //home/imported/logs/2013-06-01",
                    100 * MIB / 4
                ),
                "-src".into(),
                "logs/2013-06-01".into(),
                "-dst".into(),
                "tmp/2013-06-01".into(),
                "-jobcount".into(),
                "4".into(),
                "-lenval".into(),
                "-subkey".into(),
                "-file".into(),
                "/tmp/cache/mapreduce-yt".into(),
                "-codec".into(),
                "zlib_9".into(),
            ]
        );
    }

    #[test]
    fn test_push_spec_alternate_writer() {
        let mut config = config();
        config.source.alternate_network = true;
        config.destination.alternate_writer_server = Some("proxy-fb.example.net".into());
        let spec = push_job_spec(&config, "t", "//home/imported/t", 1, Path::new("./bridge")).unwrap();

        let JobKind::Push { launch } = spec.kind else {
            panic!("expected push job");
        };
        assert_eq!(
            launch.args[3],
            "YT_USE_HOSTS=1 ./bridge -server proxy-fb.example.net -append -lenval -subkey -write //home/imported/t"
        );
        assert_eq!(spec.rate_limit, None);
    }

    #[test]
    fn test_push_spec_alternate_network_without_alternate_writer() {
        let mut config = config();
        config.source.alternate_network = true;
        config.destination.writer_server = Some("dest-writer.example.net".into());

        let err = push_job_spec(&config, "t", "//home/imported/t", 1, Path::new("./bridge")).unwrap_err();
        assert!(matches!(err, ImportError::Config(msg) if msg.contains("alternate_writer_server")));
    }

    #[test]
    fn test_push_rate_limit_saturates() {
        let mut config = config();
        config.import.speed_limit_mb = Some(u64::MAX);
        let spec = push_job_spec(&config, "t", "//home/imported/t", 4, Path::new("./bridge")).unwrap();
        assert_eq!(spec.rate_limit, Some(u64::MAX / 4));
    }

    #[test]
    fn test_writer_command_quotes_arguments() {
        let command = writer_command("bridge", "proxy", None, "//home/with space", None);
        assert!(command.ends_with("-write '//home/with space'"));
    }
}
