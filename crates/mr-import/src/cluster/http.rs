//! Destination cluster over its HTTP proxy API.
//!
//! Commands are issued as `/api/v3/<command>` with parameters encoded as JSON
//! in the `X-YT-Parameters` header. Long-running commands (sort) return an
//! operation id that is polled until it reaches a terminal state.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::DestinationCluster;
use crate::error::{ImportError, Result};
use crate::records::RecordFormat;

const PARAMETERS_HEADER: &str = "X-YT-Parameters";
const INPUT_FORMAT_HEADER: &str = "X-YT-Input-Format";
const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// HTTP proxy client for the destination cluster.
#[derive(Clone)]
pub struct HttpCluster {
    client: Client,
    proxy: String,
    token: Option<String>,
}

impl HttpCluster {
    /// `proxy` is the proxy base URL, e.g. `http://dest-proxy.example.net`.
    pub fn new(client: Client, proxy: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            proxy: proxy.into(),
            token,
        }
    }

    fn command_url(&self, command: &str) -> String {
        let proxy = self.proxy.trim_end_matches('/');
        if proxy.starts_with("http://") || proxy.starts_with("https://") {
            format!("{}/api/v3/{}", proxy, command)
        } else {
            format!("http://{}/api/v3/{}", proxy, command)
        }
    }

    fn request(&self, method: Method, command: &str, params: &Value) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, self.command_url(command))
            .header(PARAMETERS_HEADER, params.to_string());
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("OAuth {}", token));
        }
        request
    }

    /// Send a request and turn non-success responses into errors carrying the body.
    async fn execute(&self, command: &str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ImportError::Destination(format!(
            "{} returned {}: {}",
            command,
            status,
            body.trim()
        )))
    }

    async fn json_command(&self, method: Method, command: &str, params: Value) -> Result<Value> {
        let request = self.request(method, command, &params);
        let response = self.execute(command, request).await?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(unwrap_value(serde_json::from_str(&body)?))
    }

    async fn wait_operation(&self, operation_id: &str) -> Result<()> {
        loop {
            let operation = self
                .json_command(
                    Method::GET,
                    "get_operation",
                    json!({ "operation_id": operation_id }),
                )
                .await?;
            let state = operation
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or("unknown");

            match state {
                "completed" => return Ok(()),
                "failed" | "aborted" => {
                    let reason = operation
                        .pointer("/result/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or(state);
                    return Err(ImportError::Destination(format!(
                        "operation {} {}: {}",
                        operation_id, state, reason
                    )));
                }
                _ => {
                    debug!("Operation {} is {}", operation_id, state);
                    tokio::time::sleep(OPERATION_POLL_INTERVAL).await;
                }
            }
        }
    }
}

/// The v3 API returns bare values; newer proxies wrap them as `{"value": ...}`.
fn unwrap_value(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("value") => {
            map.remove("value").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[async_trait]
impl DestinationCluster for HttpCluster {
    async fn exists(&self, path: &str) -> Result<bool> {
        let value = self
            .json_command(Method::GET, "exists", json!({ "path": path }))
            .await?;
        value
            .as_bool()
            .ok_or_else(|| ImportError::Destination(format!("exists {}: unexpected reply {}", path, value)))
    }

    async fn create_table(&self, path: &str, recursive: bool) -> Result<()> {
        self.json_command(
            Method::POST,
            "create",
            json!({ "path": path, "type": "table", "recursive": recursive }),
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.json_command(Method::POST, "remove", json!({ "path": path }))
            .await?;
        Ok(())
    }

    async fn row_count(&self, path: &str) -> Result<u64> {
        let attribute = format!("{}/@row_count", path);
        let value = self
            .json_command(Method::GET, "get", json!({ "path": attribute }))
            .await?;
        value
            .as_u64()
            .ok_or_else(|| ImportError::Destination(format!("row_count {}: unexpected reply {}", path, value)))
    }

    async fn append(
        &self,
        path: &str,
        format: RecordFormat,
        codec: Option<&str>,
        data: Bytes,
    ) -> Result<()> {
        let mut params = json!({
            "path": { "$value": path, "$attributes": { "append": true } },
        });
        if let Some(codec) = codec {
            params["table_writer"] = json!({ "codec": codec });
        }

        let request = self
            .request(Method::PUT, "write_table", &params)
            .header(INPUT_FORMAT_HEADER, format.to_format_spec().to_string())
            .body(data);
        self.execute("write_table", request).await?;
        Ok(())
    }

    async fn sort(&self, path: &str, sort_by: &[String], pool: &str) -> Result<()> {
        let spec = json!({
            "input_table_paths": [path],
            "output_table_path": path,
            "sort_by": sort_by,
            "pool": pool,
        });
        let reply = self
            .json_command(Method::POST, "sort", json!({ "spec": spec }))
            .await?;
        let operation_id = reply
            .as_str()
            .ok_or_else(|| ImportError::Destination(format!("sort {}: unexpected reply {}", path, reply)))?
            .to_string();

        info!("Sorting {} by {:?} (operation {})", path, sort_by, operation_id);
        self.wait_operation(&operation_id).await
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let request = self.request(Method::GET, "read_file", &json!({ "path": remote_path }));
        let mut response = self.execute("read_file", request).await?;

        // Write to a temp file, then rename so a partial download is never used.
        let temp_path = local_path.with_extension("download");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o755)).await?;
        }
        tokio::fs::rename(&temp_path, local_path).await?;
        Ok(())
    }

    fn cluster_type(&self) -> &'static str {
        "http-proxy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_url() {
        let cluster = HttpCluster::new(Client::new(), "http://dest-proxy/", None);
        assert_eq!(cluster.command_url("exists"), "http://dest-proxy/api/v3/exists");

        let bare = HttpCluster::new(Client::new(), "dest-proxy", None);
        assert_eq!(bare.command_url("create"), "http://dest-proxy/api/v3/create");
    }

    #[test]
    fn test_unwrap_value() {
        assert_eq!(unwrap_value(json!(true)), json!(true));
        assert_eq!(unwrap_value(json!({ "value": 42 })), json!(42));
        let op = json!({ "state": "running", "value": 1 });
        assert_eq!(unwrap_value(op.clone()), op);
    }
}
