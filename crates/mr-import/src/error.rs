//! Error types for the import library.

use thiserror::Error;

/// Main error type for import operations.
#[derive(Error, Debug)]
pub enum ImportError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source table has no records; nothing is created for it.
    #[error("Table {0} is empty")]
    EmptyTable(String),

    /// Import strategy is neither `pull` nor `push`.
    #[error("Incorrect import type: {0}")]
    UnknownStrategy(String),

    /// Destination already exists and overwrite was not requested.
    #[error("Destination {0} already exists (use --force to overwrite)")]
    DestinationExists(String),

    /// Source metadata could not be fetched or parsed.
    #[error("Metadata error for table {table}: {message}")]
    Metadata { table: String, message: String },

    /// Destination cluster request failed.
    #[error("Destination error: {0}")]
    Destination(String),

    /// The transfer job reported failure or was cancelled.
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Fetched bytes are not a well-formed length/value record stream.
    #[error("Malformed record stream: {0}")]
    Record(String),

    /// Destination row count differs from the source.
    #[error("Incorrect record count for {table}: expected={expected}, actual={actual}")]
    CountMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },

    /// Post-transfer sort failed.
    #[error("Sort failed for {table}: {message}")]
    Sort { table: String, message: String },

    /// Launched process could not start or exited unsuccessfully.
    #[error("Process {program} failed: {message}")]
    Process { program: String, message: String },

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Use a new state file to start fresh.")]
    ConfigChanged,

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Work was interrupted by a shutdown request.
    #[error("Import cancelled")]
    Cancelled,

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error (file and process operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImportError {
    /// Create a Metadata error
    pub fn metadata(table: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Metadata {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Process error
    pub fn process(program: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Process {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Create a Sort error
    pub fn sort(table: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Sort {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether the error can only occur before a destination was created.
    ///
    /// These failures need no rollback.
    pub fn is_pre_creation(&self) -> bool {
        matches!(
            self,
            ImportError::EmptyTable(_)
                | ImportError::UnknownStrategy(_)
                | ImportError::DestinationExists(_)
                | ImportError::Metadata { .. }
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ImportError::Config(_) | ImportError::UnknownStrategy(_) => 2,
            ImportError::ConfigChanged | ImportError::State(_) => 3,
            ImportError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for import operations.
pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_mismatch_carries_both_values() {
        let err = ImportError::CountMismatch {
            table: "logs/2013-01-01".into(),
            expected: 100,
            actual: 99,
        };
        assert_eq!(
            err.to_string(),
            "Incorrect record count for logs/2013-01-01: expected=100, actual=99"
        );
        assert!(!err.is_pre_creation());
    }

    #[test]
    fn test_pre_creation_errors() {
        assert!(ImportError::EmptyTable("t".into()).is_pre_creation());
        assert!(ImportError::UnknownStrategy("sync".into()).is_pre_creation());
        assert!(!ImportError::transfer("t", "boom").is_pre_creation());
        assert!(!ImportError::sort("t", "boom").is_pre_creation());
        assert!(!ImportError::Cancelled.is_pre_creation());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ImportError::Config("x".into()).exit_code(), 2);
        assert_eq!(ImportError::ConfigChanged.exit_code(), 3);
        assert_eq!(ImportError::transfer("t", "x").exit_code(), 1);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing binary");
        let err = ImportError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: missing binary"));
    }
}
