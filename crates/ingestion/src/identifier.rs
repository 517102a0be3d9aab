//! Content identifiers: the natural key of a source.

use std::fmt::Display;
use std::time::UNIX_EPOCH;

use ts_common::{DataSource, TimeSeries};

use crate::error::{IngestionError, Result};

/// Bytes in a valid digest.
pub const DIGEST_LENGTH: usize = 16;

/// Digest the canonical serialization of a time series.
///
/// Equal content always yields the same identifier; any change in events,
/// reference times, variable, feature or unit yields a different one.
pub fn identify<T: Display>(series: &TimeSeries<T>, uri: &str) -> Result<String> {
    let canonical = series.to_string();
    let digest = md5::compute(canonical.as_bytes());
    encode_digest(&digest.0, uri)
}

/// Digest the file-level identity of a gridded source: its URI and variable,
/// plus byte length and modification time when it is a readable local file.
pub async fn identify_gridded(source: &DataSource) -> Result<String> {
    let mut identity = format!(
        "{}|{}",
        source.uri(),
        source.declared().variable.as_deref().unwrap_or("")
    );

    if let Some(path) = source.path() {
        if let Ok(metadata) = tokio::fs::metadata(&path).await {
            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            identity.push_str(&format!("|{}|{}", metadata.len(), modified));
        }
    }

    let digest = md5::compute(identity.as_bytes());
    encode_digest(&digest.0, source.uri())
}

/// Upper-case hex of a raw digest. A short digest means the hash primitive
/// misbehaved and nothing derived from it can be trusted.
pub fn encode_digest(raw: &[u8], uri: &str) -> Result<String> {
    if raw.len() < DIGEST_LENGTH {
        return Err(IngestionError::pre_ingest(
            uri,
            format!(
                "digest has {} bytes, at least {} are required",
                raw.len(),
                DIGEST_LENGTH
            ),
        ));
    }
    Ok(hex::encode_upper(raw))
}
