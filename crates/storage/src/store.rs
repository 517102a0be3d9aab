//! Store primitives used by the ingest engine.
//!
//! Two backends implement these traits: the PostgreSQL [`Catalog`] and the
//! in-process [`MemoryCatalog`].
//!
//! [`Catalog`]: crate::Catalog
//! [`MemoryCatalog`]: crate::MemoryCatalog

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ts_common::{Feature, ReferenceTimeType, TimeScale, TsResult};

/// Ensemble name used for single-valued series.
pub const DEFAULT_ENSEMBLE_NAME: &str = "default";

/// Attributes persisted with a source on first registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Natural key: upper-case hex content digest
    pub hash: String,
    pub path: String,
    pub variable_name: String,
    pub measurement_unit_id: Option<i64>,
    pub feature_id: Option<i64>,
    pub time_scale_id: Option<i64>,
    /// Lead of a gridded source, in minutes
    pub lead_minutes: Option<i32>,
    pub is_point_data: bool,
}

/// Outcome of an insert-or-get registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisteredSource {
    pub source_id: i64,
    /// `true` for exactly one caller per natural key
    pub inserted: bool,
}

/// A registered source and its completion state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRow {
    pub source_id: i64,
    pub hash: String,
    pub path: String,
    pub registered_at: DateTime<Utc>,
    pub completed: bool,
}

/// One event row in a time series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRow {
    pub time_series_id: i64,
    pub lead_minutes: i32,
    /// `None` for a missing value
    pub value: Option<f64>,
}

/// Source, series and value persistence.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Insert the source unless its hash exists; report which happened.
    async fn register_source(&self, record: &SourceRecord) -> TsResult<RegisteredSource>;

    async fn find_source(&self, hash: &str) -> TsResult<Option<SourceRow>>;

    async fn insert_reference_time(
        &self,
        source_id: i64,
        kind: ReferenceTimeType,
        time: DateTime<Utc>,
    ) -> TsResult<()>;

    /// Get or create the time-series row for a (source, ensemble) pair.
    async fn insert_time_series(&self, source_id: i64, ensemble_id: i64) -> TsResult<i64>;

    /// Insert value rows, ignoring any (series, lead) already present.
    /// Returns the number of rows written.
    async fn insert_values(&self, rows: &[ValueRow]) -> TsResult<u64>;

    /// Write the completion marker. Returns `false` if it already existed.
    async fn mark_complete(&self, source_id: i64) -> TsResult<bool>;

    async fn was_completed(&self, source_id: i64) -> TsResult<bool>;

    /// Delete an incomplete source and everything written under it. Completed
    /// sources are never removed; returns whether a row was deleted.
    async fn remove_source(&self, source_id: i64) -> TsResult<bool>;

    async fn incomplete_sources(&self) -> TsResult<Vec<SourceRow>>;
}

/// Get-or-create surrogate keys for reference entities.
#[async_trait]
pub trait ReferenceKeys: Send + Sync {
    async fn feature_id(&self, feature: &Feature) -> TsResult<i64>;

    async fn measurement_unit_id(&self, unit: &str) -> TsResult<i64>;

    async fn time_scale_id(&self, time_scale: &TimeScale) -> TsResult<i64>;

    async fn ensemble_id(&self, name: &str) -> TsResult<i64>;
}
