//! Configuration validation.

use super::Config;
use crate::error::{ImportError, Result};
use crate::transfer::ImportStrategy;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.server.is_empty() {
        return Err(ImportError::Config("source.server is required".into()));
    }
    if config.source.proxies.iter().any(|p| p.is_empty()) {
        return Err(ImportError::Config(
            "source.proxies must not contain empty entries".into(),
        ));
    }

    // Destination validation
    if config.destination.proxy.is_empty() {
        return Err(ImportError::Config("destination.proxy is required".into()));
    }
    if !config.destination.root.starts_with("//") {
        return Err(ImportError::Config(format!(
            "destination.root must be an absolute path starting with '//', got '{}'",
            config.destination.root
        )));
    }

    // Import config validation - only check optional values if explicitly set
    let strategy = config.import.strategy.parse::<ImportStrategy>()?;
    if strategy == ImportStrategy::Push {
        config
            .destination
            .effective_writer_server(config.source.alternate_network)?;
    }
    if config.import.record_threshold == 0 {
        return Err(ImportError::Config(
            "import.record_threshold must be at least 1".into(),
        ));
    }
    if let Some(0) = config.import.job_count {
        return Err(ImportError::Config(
            "import.job_count must be at least 1".into(),
        ));
    }
    if let Some(0) = config.import.speed_limit_mb {
        return Err(ImportError::Config(
            "import.speed_limit_mb must be at least 1".into(),
        ));
    }
    if let Some(0) = config.import.parallel_tables {
        return Err(ImportError::Config(
            "import.parallel_tables must be at least 1".into(),
        ));
    }
    if let Some(0) = config.import.local_workers {
        return Err(ImportError::Config(
            "import.local_workers must be at least 1".into(),
        ));
    }

    Ok(())
}
