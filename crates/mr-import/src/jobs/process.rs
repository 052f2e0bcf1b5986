//! Structured process launches.
//!
//! Commands are described as a program, an argument vector and extra
//! environment variables, never as a shell string. The only place shell
//! syntax appears is the mapper command handed to the legacy cluster, which
//! is assembled with [`shell_quote`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ImportError, Result};

const READ_CHUNK_SIZE: usize = 256 * 1024;

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Variables added to the inherited environment.
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

/// Renders the launch as an equivalent shell command line, for logs.
impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
            .collect();
        parts.push(shell_quote(&self.program_name()));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        write!(f, "{}", parts.join(" "))
    }
}

/// Runs external programs.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run to completion. A non-zero exit is an error; cancellation kills the
    /// process and returns [`ImportError::Cancelled`].
    async fn run(&self, spec: &LaunchSpec, cancel: &CancellationToken) -> Result<()>;

    /// Stream the process's stdout in chunks. The last item is an error if
    /// the process could not start or exited unsuccessfully. Dropping the
    /// receiver kills the process.
    fn stream_stdout(&self, spec: LaunchSpec) -> mpsc::Receiver<Result<Bytes>>;
}

/// [`ProcessLauncher`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessLauncher;

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn run(&self, spec: &LaunchSpec, cancel: &CancellationToken) -> Result<()> {
        let mut child = spec
            .command()
            .spawn()
            .map_err(|e| ImportError::process(spec.program_name(), e.to_string()))?;

        let status = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status?),
        };
        let Some(status) = status else {
            debug!("Killing {} on cancellation", spec.program_name());
            let _ = child.kill().await;
            return Err(ImportError::Cancelled);
        };

        if status.success() {
            Ok(())
        } else {
            Err(ImportError::process(spec.program_name(), format!("exited with {}", status)))
        }
    }

    fn stream_stdout(&self, spec: LaunchSpec) -> mpsc::Receiver<Result<Bytes>> {
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            if let Err(e) = stream_stdout_internal(&spec, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }
}

async fn stream_stdout_internal(spec: &LaunchSpec, tx: &mpsc::Sender<Result<Bytes>>) -> Result<()> {
    let mut child = spec
        .command()
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| ImportError::process(spec.program_name(), e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ImportError::process(spec.program_name(), "stdout not captured"))?;

    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        buf.reserve(READ_CHUNK_SIZE);
        if stdout.read_buf(&mut buf).await? == 0 {
            break;
        }
        if tx.send(Ok(buf.split().freeze())).await.is_err() {
            // Receiver gone; kill_on_drop reaps the child.
            return Ok(());
        }
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(ImportError::process(spec.program_name(), format!("exited with {}", status)))
    }
}

/// Quote an argument for a POSIX shell.
///
/// Arguments made only of characters that are never special are returned
/// unchanged; anything else is wrapped in single quotes.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
