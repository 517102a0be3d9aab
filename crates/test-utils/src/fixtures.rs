//! Common test fixtures for time-series ingest tests.
//!
//! This module provides pre-defined data that represents common scenarios:
//! a forecast issued at a fixed reference time for a single stream gauge.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

use ts_common::{
    DataDisposition, DataSource, DatasetOrientation, DeclaredSource, Feature, ReferenceTimeType,
    TimeSeriesMetadata,
};

/// Variable name used by fixture series.
pub const VARIABLE: &str = "streamflow";

/// Measurement unit used by fixture series.
pub const UNIT: &str = "CMS";

/// Gauge identifier used by fixture series.
pub const FEATURE_NAME: &str = "DRRC2";

/// Ensemble member labels used by the ensemble fixture.
pub const ENSEMBLE_LABELS: [&str; 3] = ["123", "456", "567"];

/// Reference (issue) time of fixture forecasts: 2023-04-01T00:00:00Z.
pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap()
}

/// A valid time `minutes` after [`reference_time`].
pub fn valid_time(minutes: i64) -> DateTime<Utc> {
    reference_time() + chrono::Duration::minutes(minutes)
}

/// The fixture gauge.
pub fn feature() -> Feature {
    Feature::new(FEATURE_NAME)
        .with_description("Dolores River near Rico")
        .with_geometry(4326, "POINT(-108.06 37.69)")
}

/// Metadata with a single T0 reference time.
pub fn forecast_metadata() -> TimeSeriesMetadata {
    TimeSeriesMetadata::new(VARIABLE, feature(), UNIT)
        .with_reference_time(ReferenceTimeType::T0, reference_time())
}

/// Metadata without any reference time, as for raw observations.
pub fn metadata_without_reference_time() -> TimeSeriesMetadata {
    TimeSeriesMetadata::new(VARIABLE, feature(), UNIT)
}

/// A left-oriented source with no links.
pub fn data_source(uri: &str, disposition: DataDisposition) -> DataSource {
    DataSource::new(
        disposition,
        uri,
        DatasetOrientation::Left,
        Vec::new(),
        Arc::new(DeclaredSource::new(uri)),
    )
}

/// A source occurring `count` times in the left orientation.
pub fn data_source_with_left_links(uri: &str, count: usize) -> DataSource {
    DataSource::new(
        DataDisposition::CsvWres,
        uri,
        DatasetOrientation::Left,
        vec![DatasetOrientation::Left; count.saturating_sub(1)],
        Arc::new(DeclaredSource::new(uri)),
    )
}
