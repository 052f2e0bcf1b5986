//! Range fetchers used by pull workers.
//!
//! A fetcher turns one [`TransferRange`] into a stream of raw length/value
//! encoded chunks. Chunk boundaries are arbitrary; callers reassemble records.

use bytes::Bytes;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use super::process::{LaunchSpec, ProcessLauncher};
use crate::error::{ImportError, Result};
use crate::partition::TransferRange;

/// Reads the encoded records of one range from the source.
pub trait RangeFetcher: Send + Sync {
    /// Start fetching; the last item is an error if the read failed.
    fn fetch(&self, table: &str, range: &TransferRange) -> mpsc::Receiver<Result<Bytes>>;

    /// Human-readable form of the read, logged when commands are traced.
    fn describe(&self, table: &str, range: &TransferRange) -> String;
}

/// Reads ranges from the source's HTTP read proxies.
#[derive(Debug, Clone)]
pub struct HttpRangeFetcher {
    client: Client,
}

impl HttpRangeFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// `http://{endpoint}/table/{table}?subkey=1&lenval=1&startindex=S&endindex=E`
    pub fn range_url(table: &str, range: &TransferRange) -> Result<Url> {
        let mut url = Url::parse(&format!("http://{}/", range.endpoint)).map_err(|e| {
            ImportError::transfer(table, format!("invalid endpoint {}: {}", range.endpoint, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| ImportError::transfer(table, format!("invalid endpoint {}", range.endpoint)))?
            .clear()
            .push("table")
            .push(table);
        url.query_pairs_mut()
            .append_pair("subkey", "1")
            .append_pair("lenval", "1")
            .append_pair("startindex", &range.start.to_string())
            .append_pair("endindex", &range.end.to_string());
        Ok(url)
    }
}

impl RangeFetcher for HttpRangeFetcher {
    fn fetch(&self, table: &str, range: &TransferRange) -> mpsc::Receiver<Result<Bytes>> {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        let table = table.to_string();
        let range = range.clone();

        tokio::spawn(async move {
            if let Err(e) = fetch_http_internal(&client, &table, &range, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    fn describe(&self, table: &str, range: &TransferRange) -> String {
        match Self::range_url(table, range) {
            Ok(url) => format!("GET {}", url),
            Err(e) => e.to_string(),
        }
    }
}

async fn fetch_http_internal(
    client: &Client,
    table: &str,
    range: &TransferRange,
    tx: &mpsc::Sender<Result<Bytes>>,
) -> Result<()> {
    let url = HttpRangeFetcher::range_url(table, range)?;
    let mut response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| ImportError::transfer(table, format!("GET {} failed: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ImportError::transfer(
            table,
            format!("GET {} returned {}", url, status),
        ));
    }

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ImportError::transfer(table, format!("reading {} failed: {}", url, e)))?
    {
        if tx.send(Ok(chunk)).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Reads ranges by running the legacy binary against the execution endpoint.
#[derive(Clone)]
pub struct LegacyRangeFetcher {
    launcher: Arc<dyn ProcessLauncher>,
    binary: PathBuf,
    alternate_network: bool,
}

impl LegacyRangeFetcher {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, binary: PathBuf, alternate_network: bool) -> Self {
        Self {
            launcher,
            binary,
            alternate_network,
        }
    }

    /// `USER=yt MR_USER=tmp <binary> -server S [-opt net_table=fastbone] -read T:[S,E] -lenval -subkey`
    pub fn launch_spec(&self, table: &str, range: &TransferRange) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.binary)
            .env("USER", "yt")
            .env("MR_USER", "tmp")
            .args(["-server", range.endpoint.as_str()]);
        if self.alternate_network {
            spec = spec.args(["-opt", "net_table=fastbone"]);
        }
        spec.arg("-read")
            .arg(format!("{}:[{},{}]", table, range.start, range.end))
            .args(["-lenval", "-subkey"])
    }
}

impl RangeFetcher for LegacyRangeFetcher {
    fn fetch(&self, table: &str, range: &TransferRange) -> mpsc::Receiver<Result<Bytes>> {
        self.launcher.stream_stdout(self.launch_spec(table, range))
    }

    fn describe(&self, table: &str, range: &TransferRange) -> String {
        self.launch_spec(table, range).to_string()
    }
}
