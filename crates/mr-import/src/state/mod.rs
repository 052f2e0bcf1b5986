//! File-based batch ledger for resume capability.

use crate::error::{ImportError, Result};
use crate::orchestrator::{MigrationPhase, MigrationResult, Outcome};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Ledger of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    /// When the batch started.
    pub started_at: DateTime<Utc>,

    /// Current run status.
    pub status: RunStatus,

    /// Per-table state, ordered so the signed serialization is stable.
    pub tables: BTreeMap<String, TableState>,

    /// When the batch finished (if finished).
    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 signature for integrity validation.
    /// Computed over serialized state (excluding this field) using config_hash as key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Per-table state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    /// Last phase the table reached; `completed` or `failed` once done.
    pub phase: MigrationPhase,

    /// Phase the import was in when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_during: Option<MigrationPhase>,

    /// Destination path, once known.
    pub destination: Option<String>,

    /// Rows in the destination after verification.
    pub rows_transferred: u64,

    /// Whether a partial destination was removed after the failure.
    #[serde(default)]
    pub rolled_back: bool,

    /// When the table import completed.
    pub completed_at: Option<DateTime<Utc>>,

    /// Error message if failed.
    pub error: Option<String>,
}

impl ImportState {
    /// Create a new ledger.
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            tables: BTreeMap::new(),
            completed_at: None,
            hmac: None, // Computed on first save
        }
    }

    /// Compute HMAC-SHA256 signature for state integrity validation.
    ///
    /// Uses config_hash as HMAC key, so a ledger cannot be edited without
    /// also knowing the configuration it was written for.
    fn compute_hmac(&self) -> Result<String> {
        let mut state_for_signing = self.clone();
        state_for_signing.hmac = None;

        let content = serde_json::to_string(&state_for_signing)
            .map_err(|e| ImportError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| ImportError::State(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load state from a file, rejecting it if the signature does not match.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        match &state.hmac {
            Some(stored) if *stored == state.compute_hmac()? => Ok(state),
            Some(_) => Err(ImportError::State(
                "State file integrity check failed: HMAC mismatch (possible tampering)".to_string(),
            )),
            None => Err(ImportError::State(
                "State file has no HMAC signature".to_string(),
            )),
        }
    }

    /// Save state to a file (atomic write with HMAC).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ImportError::State(format!("Failed to serialize state: {}", e)))?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(ImportError::ConfigChanged);
        }
        Ok(())
    }

    /// Record a finished table.
    pub fn record(&mut self, result: &MigrationResult) {
        let completed = result.outcome == Outcome::Completed;
        self.tables.insert(
            result.table.clone(),
            TableState {
                phase: if completed {
                    MigrationPhase::Completed
                } else {
                    MigrationPhase::Failed
                },
                failed_during: result.failed_during,
                destination: result.destination.clone(),
                rows_transferred: result.transferred_count,
                rolled_back: result.rolled_back,
                completed_at: completed.then(Utc::now),
                error: result.error.clone(),
            },
        );
    }

    /// Check if a table is completed.
    pub fn is_table_completed(&self, table: &str) -> bool {
        self.tables
            .get(table)
            .map(|t| t.phase == MigrationPhase::Completed)
            .unwrap_or(false)
    }

    /// Mark the run finished with `status`.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}
