//! Error types for the ingestion crate.

use std::fmt::Display;

use thiserror::Error;
use ts_common::{DataDisposition, DatasetOrientation, TsError};

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Failed to read file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Nothing was written for the source.
    #[error("Pre-ingest failure for '{uri}': {message}")]
    PreIngest { uri: String, message: String },

    /// Writing started; the source is left in flight without a marker.
    #[error("Ingest failure for '{uri}': {message}")]
    Ingest { uri: String, message: String },

    #[error("Failed to read time series from '{uri}': {message}")]
    Read { uri: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] TsError),

    #[error("Value write failed: {0}")]
    Latch(String),

    #[error("{orientation} occurs {count} times, more than the {max} an ingest result can record")]
    OccurrenceOverflow {
        orientation: DatasetOrientation,
        count: usize,
        max: u8,
    },

    #[error("Invalid ingest result: {0}")]
    InvalidResult(String),

    #[error("No reader registered for {0}")]
    NoReader(DataDisposition),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IngestionError {
    pub fn pre_ingest(uri: impl Into<String>, message: impl Display) -> Self {
        IngestionError::PreIngest {
            uri: uri.into(),
            message: message.to_string(),
        }
    }

    pub fn ingest(uri: impl Into<String>, message: impl Display) -> Self {
        IngestionError::Ingest {
            uri: uri.into(),
            message: message.to_string(),
        }
    }

    /// The source URI named by the error, if any.
    pub fn uri(&self) -> Option<&str> {
        match self {
            IngestionError::PreIngest { uri, .. }
            | IngestionError::Ingest { uri, .. }
            | IngestionError::Read { uri, .. } => Some(uri),
            _ => None,
        }
    }
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestionError>;
