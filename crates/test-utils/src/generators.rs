//! Test data generators for synthetic time series and source files.
//!
//! These generators create predictable, verifiable series that can be used
//! across the test suite.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use ts_common::{Ensemble, Event, SeriesData, TimeSeries, TimeSeriesMetadata};

use crate::fixtures::{forecast_metadata, valid_time, ENSEMBLE_LABELS};

/// Creates a single-valued series from (lead minutes, value) pairs.
///
/// # Example
///
/// ```
/// use test_utils::{forecast_metadata, single_valued_series};
///
/// let series = single_valued_series(forecast_metadata(), &[(60, 30.0)]);
/// assert_eq!(series.len(), 1);
/// ```
pub fn single_valued_series(metadata: TimeSeriesMetadata, events: &[(i64, f64)]) -> TimeSeries<f64> {
    TimeSeries::from_events(
        metadata,
        events
            .iter()
            .map(|(minutes, value)| Event::new(valid_time(*minutes), *value)),
    )
    .expect("generated events have distinct valid times")
}

/// Creates an hourly forecast of `count` events with values `1.0, 2.0, ...`.
pub fn hourly_forecast(count: usize) -> SeriesData {
    let events: Vec<(i64, f64)> = (1..=count)
        .map(|hour| (hour as i64 * 60, hour as f64))
        .collect();
    SeriesData::SingleValued(single_valued_series(forecast_metadata(), &events))
}

/// Creates an hourly ensemble forecast over [`ENSEMBLE_LABELS`].
///
/// Member `m` (0-based) at hour `h` has value `m * 100 + h`, so every value
/// identifies its member and lead.
pub fn ensemble_series(count: usize) -> TimeSeries<Ensemble> {
    let events = (1..=count).map(|hour| {
        let members = ENSEMBLE_LABELS
            .iter()
            .enumerate()
            .map(|(m, label)| (*label, (m * 100 + hour) as f64));
        Event::new(
            valid_time(hour as i64 * 60),
            Ensemble::new(members).expect("fixture labels are unique"),
        )
    });
    TimeSeries::from_events(forecast_metadata(), events)
        .expect("generated events have distinct valid times")
}

/// Returns a 32-character upper-case hex string unique within the process
/// and, with overwhelming likelihood, across runs.
pub fn unique_hash(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let count = u128::from(COUNTER.fetch_add(1, Ordering::Relaxed));
    let salt = prefix
        .bytes()
        .fold(0u128, |acc, b| acc.wrapping_mul(31).wrapping_add(u128::from(b)));
    format!("{:032X}", nanos.wrapping_add(count << 64) ^ salt)
}

/// Gzip-compresses `contents` into `path`.
pub fn write_gzip_file(path: &Path, contents: &[u8]) -> PathBuf {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(contents).expect("gzip write");
    let compressed = encoder.finish().expect("gzip finish");
    std::fs::write(path, compressed).expect("Failed to write gzip file");
    path.to_path_buf()
}

/// Writes a tar archive at `path` holding `(name, contents)` members.
pub fn write_tar_file(path: &Path, members: &[(&str, &[u8])]) -> PathBuf {
    let file = std::fs::File::create(path).expect("Failed to create tar file");
    let mut builder = tar::Builder::new(file);
    for (name, contents) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *contents)
            .expect("Failed to append tar member");
    }
    builder.finish().expect("Failed to finish tar file");
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensemble_values_identify_member_and_hour() {
        let series = ensemble_series(5);
        assert_eq!(series.len(), 5);
        let traces = series.traces().unwrap();
        assert_eq!(traces.len(), 3);
        assert_eq!(traces[2].0, "567");
        assert_eq!(traces[2].1[4].1, 205.0);
    }

    #[test]
    fn test_unique_hash_shape() {
        let a = unique_hash("x");
        let b = unique_hash("x");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
