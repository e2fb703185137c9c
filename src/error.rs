//! Error types for the recording engine.
//!
//! None of these ever escape the engine's recording path: storage and sink
//! faults are logged and swallowed at the engine boundary. They surface only
//! from the lower-level stores and from export.

use thiserror::Error;

/// Failures of a [`crate::persistence::SnapshotStore`] backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of an attached telemetry sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("telemetry sink unavailable: {0}")]
    Unavailable(String),

    #[error("telemetry sink backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for SinkError {
    fn from(e: rusqlite::Error) -> Self {
        SinkError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        SinkError::Backend(e.to_string())
    }
}

/// Outcomes of an export request that produce no artifact
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no clicks recorded, nothing to export")]
    NothingToExport,

    #[error("failed to render csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to write export: {0}")]
    Io(#[from] std::io::Error),
}

impl From<csv::IntoInnerError<csv::Writer<Vec<u8>>>> for ExportError {
    fn from(e: csv::IntoInnerError<csv::Writer<Vec<u8>>>) -> Self {
        ExportError::Io(e.into_error())
    }
}
