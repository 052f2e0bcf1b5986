//! Metadata scraped from the legacy cluster's `/debug?info=table` page.

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{MetadataProvider, TableDescriptor};
use crate::error::{ImportError, Result};

/// Reads table metadata from `http://{server}:{http_port}/debug`.
#[derive(Debug, Clone)]
pub struct HttpMetadataProvider {
    client: Client,
    base_url: String,
}

impl HttpMetadataProvider {
    /// `base_url` is the diagnostic server root, e.g. `http://mr-source:13013`.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn fetch_page(&self, table: &str) -> Result<String> {
        let url = format!("{}/debug", self.base_url.trim_end_matches('/'));
        debug!("Fetching metadata page for {} from {}", table, url);

        let response = self
            .client
            .get(&url)
            .query(&[("info", "table"), ("table", table)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::metadata(
                table,
                format!("debug page returned {}", status),
            ));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl MetadataProvider for HttpMetadataProvider {
    async fn record_count(&self, table: &str) -> Result<u64> {
        let page = self.fetch_page(table).await?;
        parse_record_count(&page)
            .ok_or_else(|| ImportError::metadata(table, "no 'Records:' line on debug page"))
    }

    async fn is_sorted(&self, table: &str) -> Result<bool> {
        let page = self.fetch_page(table).await?;
        parse_is_sorted(&page)
            .ok_or_else(|| ImportError::metadata(table, "no 'Sorted:' line on debug page"))
    }

    async fn is_empty(&self, table: &str) -> Result<bool> {
        let page = self.fetch_page(table).await?;
        Ok(parse_is_empty(&page))
    }

    /// One page fetch answers all three questions.
    async fn describe(&self, table: &str, endpoints: &[String]) -> Result<TableDescriptor> {
        let page = self.fetch_page(table).await?;
        let is_empty = parse_is_empty(&page);
        let (record_count, is_sorted) = if is_empty {
            (0, false)
        } else {
            let count = parse_record_count(&page)
                .ok_or_else(|| ImportError::metadata(table, "no 'Records:' line on debug page"))?;
            let sorted = parse_is_sorted(&page)
                .ok_or_else(|| ImportError::metadata(table, "no 'Sorted:' line on debug page"))?;
            (count, sorted)
        };

        Ok(TableDescriptor {
            name: table.to_string(),
            endpoints: endpoints.to_vec(),
            record_count,
            is_sorted,
            is_empty,
        })
    }

    fn provider_type(&self) -> &'static str {
        "http-debug-page"
    }
}

/// Record count from the first line mentioning `Records`, e.g.
/// `<b>Records:</b> 12,345,678`.
pub fn parse_record_count(page: &str) -> Option<u64> {
    let line = page.lines().find(|line| line.contains("Records"))?;
    let line = line.replace("</b>", "").replace(',', "");
    let (_, rest) = line.split_once("Records:")?;
    rest.split_whitespace().next()?.parse().ok()
}

/// Sorted flag from the first line mentioning `Sorted`, e.g.
/// `<b>Sorted:</b> yes`.
pub fn parse_is_sorted(page: &str) -> Option<bool> {
    let line = page.lines().find(|line| line.contains("Sorted"))?;
    let line = line.replace("</b>", "");
    let (_, rest) = line.split_once("Sorted:")?;
    let flag = rest.split_whitespace().next().unwrap_or("");
    Some(flag.eq_ignore_ascii_case("yes"))
}

/// Whether the first line mentioning `is empty` reads `Table is empty`.
pub fn parse_is_empty(page: &str) -> bool {
    page.lines()
        .find(|line| line.contains("is empty"))
        .map(|line| line.trim_start().starts_with("Table is empty"))
        .unwrap_or(false)
}
