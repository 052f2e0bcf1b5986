//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration for resume validation.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl SourceConfig {
    /// Whether ranges are read through HTTP proxies rather than the legacy binary.
    pub fn uses_proxies(&self) -> bool {
        !self.proxies.is_empty()
    }

    /// Endpoints ranges are assigned to, in round-robin order.
    pub fn read_endpoints(&self) -> Vec<String> {
        if self.uses_proxies() {
            self.proxies
                .iter()
                .map(|proxy| format!("{}:{}", proxy, self.http_port))
                .collect()
        } else {
            vec![self.execution_endpoint()]
        }
    }

    /// `server:server_port`, the address the legacy binary talks to.
    pub fn execution_endpoint(&self) -> String {
        format!("{}:{}", self.server, self.server_port)
    }

    /// Base URL of the source diagnostic pages.
    pub fn debug_base_url(&self) -> String {
        let server = self.server.trim_end_matches('/');
        if server.starts_with("http://") || server.starts_with("https://") {
            format!("{}:{}", server, self.http_port)
        } else {
            format!("http://{}:{}", server, self.http_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;

    const MINIMAL: &str = r#"
source:
  server: mr-source.example.net
destination:
  proxy: http://dest-proxy.example.net
  root: //home/imported
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.source.server_port, 8013);
        assert_eq!(config.source.http_port, 13013);
        assert_eq!(config.import.record_threshold, 5_000_000);
        assert_eq!(config.import.strategy, "pull");
        assert_eq!(config.import.pool, "restricted");
        assert_eq!(config.destination.bridge_remote_path, "//home/files/mapreduce-yt");
        assert!(!config.destination.force);
    }

    #[test]
    fn test_read_endpoints_without_proxies() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            config.source.read_endpoints(),
            vec!["mr-source.example.net:8013".to_string()]
        );
    }

    #[test]
    fn test_read_endpoints_with_proxies() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.source.proxies = vec!["p1".into(), "p2".into()];
        assert_eq!(
            config.source.read_endpoints(),
            vec!["p1:13013".to_string(), "p2:13013".to_string()]
        );
    }

    #[test]
    fn test_debug_base_url() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            config.source.debug_base_url(),
            "http://mr-source.example.net:13013"
        );
    }

    #[test]
    fn test_table_path_joins_root() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            config.destination.table_path("user_sessions/2013-06-01"),
            "//home/imported/user_sessions/2013-06-01"
        );
    }

    #[test]
    fn test_writer_server_defaults_to_proxy_host() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            config.destination.effective_writer_server(false).unwrap(),
            "dest-proxy.example.net"
        );
        config.destination.writer_server = Some("dest-writer.example.net".into());
        assert_eq!(
            config.destination.effective_writer_server(false).unwrap(),
            "dest-writer.example.net"
        );
    }

    #[test]
    fn test_alternate_network_never_falls_back_to_regular_writer() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.destination.writer_server = Some("dest-writer.example.net".into());
        assert!(matches!(
            config.destination.effective_writer_server(true),
            Err(ImportError::Config(_))
        ));

        config.destination.alternate_writer_server = Some("dest-proxy-fb.example.net".into());
        assert_eq!(
            config.destination.effective_writer_server(true).unwrap(),
            "dest-proxy-fb.example.net"
        );
        assert_eq!(
            config.destination.effective_writer_server(false).unwrap(),
            "dest-writer.example.net"
        );
    }

    #[test]
    fn test_hash_changes_with_config() {
        let a = Config::from_yaml(MINIMAL).unwrap();
        let mut b = a.clone();
        assert_eq!(a.hash(), b.hash());
        b.import.record_threshold = 10;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_job_count_for_defaults_to_range_count() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.import.job_count_for(3), 3);
        config.import.job_count = Some(7);
        assert_eq!(config.import.job_count_for(3), 7);
    }
}
