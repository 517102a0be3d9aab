//! Error types for time-series ingest services.

use thiserror::Error;

/// Result type alias using TsError.
pub type TsResult<T> = Result<T, TsError>;

/// Primary error type for store and model operations.
#[derive(Debug, Error)]
pub enum TsError {
    // === Model Errors ===
    #[error("Invalid time series: {0}")]
    InvalidSeries(String),

    #[error("Unrecognized disposition: {0}")]
    UnknownDisposition(String),

    // === Storage Errors ===
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Source not found: {0}")]
    SourceNotFound(i64),

    #[error("Lock error: {0}")]
    LockError(String),

    // === Infrastructure Errors ===
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}
