//! Error types for the leakage hunter.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum HunterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown application: {0}")]
    UnknownApplication(String),

    #[error("malformed transaction {block}_{tx_index}: {cause}")]
    MalformedTx {
        block: u64,
        tx_index: usize,
        cause: String,
    },

    #[error("inconsistent replay output for {block}_{tx_index}: expected {expected}, got {actual}")]
    Inconsistent {
        block: u64,
        tx_index: usize,
        expected: String,
        actual: String,
    },

    #[error("storage error at {}: {cause}", .path.display())]
    Storage { path: PathBuf, cause: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl HunterError {
    /// Whether the affected work unit can be skipped without aborting the run.
    ///
    /// Malformed transactions and missing backing files degrade the analysis
    /// (the affected token or sub-task is dropped); everything else aborts.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HunterError::MalformedTx { .. } | HunterError::Storage { .. }
        )
    }
}
