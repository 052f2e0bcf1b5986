//! mr-import CLI - Partitioned import of legacy MapReduce tables.

use clap::{Args, Parser, Subcommand};
use mr_import::{Config, ImportError, Orchestrator};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mr-import")]
#[command(about = "Import tables from a legacy MapReduce cluster into the destination cluster")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file. Without it the configuration is
    /// built from command-line flags alone.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds in-flight tables are given to wind down after a signal
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import tables, continuing past failed ones
    Run(TableArgs),

    /// Show each table's range plan without touching the destination
    Plan(TableArgs),

    /// Compare source record counts with destination row counts
    Validate(TableArgs),
}

#[derive(Args)]
struct TableArgs {
    /// Source tables to process
    #[arg(value_name = "TABLE")]
    table: Vec<String>,

    /// File listing source tables, one per line ('#' starts a comment)
    #[arg(long = "tables", value_name = "FILE")]
    tables_file: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

/// Flags overriding the corresponding configuration fields.
#[derive(Args)]
struct Overrides {
    /// Destination directory; tables land at <DESTINATION>/<table>
    #[arg(long)]
    destination: Option<String>,

    /// Destination cluster HTTP proxy
    #[arg(long, env = "YT_PROXY")]
    destination_proxy: Option<String>,

    /// Destination cluster token
    #[arg(long, env = "YT_TOKEN", hide_env_values = true)]
    destination_token: Option<String>,

    /// Source server host
    #[arg(long)]
    server: Option<String>,

    /// Transfer strategy: pull or push
    #[arg(long = "import-type", value_name = "STRATEGY")]
    import_type: Option<String>,

    /// Source HTTP read proxy (repeatable)
    #[arg(long = "proxy", value_name = "HOST")]
    proxies: Vec<String>,

    /// Source execution port [config default: 8013]
    #[arg(long)]
    server_port: Option<u16>,

    /// Source HTTP port [config default: 13013]
    #[arg(long)]
    http_port: Option<u16>,

    /// Maximum records per range [config default: 5000000]
    #[arg(long)]
    record_threshold: Option<u64>,

    /// Number of transfer jobs (derived from the range count if not set)
    #[arg(long)]
    job_count: Option<usize>,

    /// Total write rate for push imports, in MB/s
    #[arg(long)]
    speed: Option<u64>,

    /// Compression codec for destination tables
    #[arg(long)]
    codec: Option<String>,

    /// Remove existing destination tables before importing
    #[arg(long)]
    force: bool,

    /// Route transfers over the alternate (fastbone) network
    #[arg(long)]
    fastbone: bool,

    /// Destination server push writers talk to (defaults to the proxy host)
    #[arg(long, value_name = "HOST")]
    writer_server: Option<String>,

    /// Destination server push writers talk to with --fastbone
    #[arg(long, value_name = "HOST")]
    alternate_writer_server: Option<String>,

    /// Log every fetch command issued by transfer workers
    #[arg(long)]
    debug: bool,

    /// Compute pool for transfer jobs
    #[arg(long)]
    pool: Option<String>,

    /// Tables imported concurrently
    #[arg(long)]
    parallel_tables: Option<usize>,

    /// Path to the legacy MapReduce binary
    #[arg(long = "mapreduce-binary", value_name = "PATH")]
    legacy_binary: Option<PathBuf>,

    /// Local copy of the bridging writer binary (fetched from the destination if not set)
    #[arg(long = "yt-binary", value_name = "PATH")]
    bridge_binary: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(root) = self.destination {
            config.destination.root = root;
        }
        if let Some(proxy) = self.destination_proxy {
            config.destination.proxy = proxy;
        }
        if let Some(token) = self.destination_token {
            config.destination.token = Some(token);
        }
        if let Some(server) = self.server {
            config.source.server = server;
        }
        if let Some(strategy) = self.import_type {
            config.import.strategy = strategy;
        }
        if !self.proxies.is_empty() {
            config.source.proxies = self.proxies;
        }
        if let Some(port) = self.server_port {
            config.source.server_port = port;
        }
        if let Some(port) = self.http_port {
            config.source.http_port = port;
        }
        if let Some(threshold) = self.record_threshold {
            config.import.record_threshold = threshold;
        }
        if let Some(jobs) = self.job_count {
            config.import.job_count = Some(jobs);
        }
        if let Some(speed) = self.speed {
            config.import.speed_limit_mb = Some(speed);
        }
        if let Some(codec) = self.codec {
            config.import.codec = Some(codec);
        }
        if self.force {
            config.destination.force = true;
        }
        if self.fastbone {
            config.source.alternate_network = true;
        }
        if let Some(server) = self.writer_server {
            config.destination.writer_server = Some(server);
        }
        if let Some(server) = self.alternate_writer_server {
            config.destination.alternate_writer_server = Some(server);
        }
        if self.debug {
            config.import.debug = true;
        }
        if let Some(pool) = self.pool {
            config.import.pool = pool;
        }
        if let Some(parallel) = self.parallel_tables {
            config.import.parallel_tables = Some(parallel);
        }
        if let Some(binary) = self.legacy_binary {
            config.source.legacy_binary = binary;
        }
        if let Some(binary) = self.bridge_binary {
            config.destination.bridge_binary = Some(binary);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, ImportError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(ImportError::Config)?;

    let (args, mode) = match cli.command {
        Commands::Run(args) => (args, Mode::Run),
        Commands::Plan(args) => (args, Mode::Plan),
        Commands::Validate(args) => (args, Mode::Validate),
    };

    let config = load_config(cli.config.as_deref(), args.overrides)?;
    let tables = collect_tables(args.tables_file.as_deref(), args.table)?;

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
    let orchestrator = Orchestrator::connect(config, cancel_token.clone())?;

    match mode {
        Mode::Run => {
            let mut orchestrator = orchestrator;
            if let Some(path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path).resume()?;
            }

            let report = orchestrator.run(&tables, Some(cancel_token)).await?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                println!("\nImport {}!", report.status);
                println!("  Run ID: {}", report.run_id);
                println!("  Duration: {:.2}s", report.duration_seconds);
                println!(
                    "  Tables: {}/{} ({} skipped)",
                    report.tables_completed, report.tables_total, report.tables_skipped
                );
                println!("  Rows: {}", report.rows_transferred);
                if !report.failed_tables.is_empty() {
                    println!("  Failed tables: {:?}", report.failed_tables);
                }
            }

            if report.tables_failed > 0 {
                return Ok(ExitCode::from(1));
            }
            if report.tables_cancelled > 0 {
                return Ok(ExitCode::from(ImportError::Cancelled.exit_code()));
            }
        }
        Mode::Plan => {
            let plans = orchestrator.plan(&tables).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                for plan in &plans {
                    println!(
                        "{} -> {} ({}, {} records, sorted: {}, {} jobs)",
                        plan.table,
                        plan.destination,
                        plan.strategy,
                        plan.record_count,
                        plan.is_sorted,
                        plan.job_count
                    );
                    if plan.ranges.is_empty() {
                        println!("  empty, would be skipped");
                    }
                    for range in &plan.ranges {
                        println!("  {}", range);
                    }
                }
            }
        }
        Mode::Validate => {
            let rows = orchestrator.validate(&tables).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("Validation Results:");
                for row in &rows {
                    let destination = row
                        .destination_count
                        .map(|count| count.to_string())
                        .unwrap_or_else(|| "missing".to_string());
                    println!(
                        "  {} {}: source {}, destination {}",
                        if row.matches { "✓" } else { "✗" },
                        row.table,
                        row.source_count,
                        destination
                    );
                }
            }

            if rows.iter().any(|row| !row.matches) {
                return Ok(ExitCode::from(1));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

enum Mode {
    Run,
    Plan,
    Validate,
}

/// Build the effective configuration: the file (if any), then flag overrides.
fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<Config, ImportError> {
    let mut config = match path {
        Some(path) => {
            let config = Config::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => Config::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config.with_auto_tuning())
}

/// Tables from the list file followed by those given on the command line.
fn collect_tables(file: Option<&Path>, extra: Vec<String>) -> Result<Vec<String>, ImportError> {
    let mut tables = Vec::new();
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)?;
        tables.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    tables.extend(extra);

    if tables.is_empty() {
        return Err(ImportError::Config(
            "no tables given: pass table names or --tables <FILE>".to_string(),
        ));
    }
    Ok(tables)
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, ImportError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Stopping after in-flight tables (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();

        tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
        eprintln!("Shutdown timeout reached, exiting");
        std::process::exit(i32::from(ImportError::Cancelled.exit_code()));
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, ImportError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!(
            "\nReceived Ctrl-C. Stopping after in-flight tables (timeout: {}s)...",
            shutdown_timeout
        );
        token.cancel();

        tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
        std::process::exit(i32::from(ImportError::Cancelled.exit_code()));
    });

    Ok(cancel_token)
}
