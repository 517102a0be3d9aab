//! Common types and utilities shared across the time-series ingest workspace.

pub mod declaration;
pub mod error;
pub mod missing;
pub mod series;
pub mod source;

pub use declaration::{Declaration, DeclaredSource};
pub use error::{TsError, TsResult};
pub use missing::{is_missing, MISSING_VALUE};
pub use series::{
    Ensemble, EnsembleMember, Event, Feature, ReferenceTimeType, SeriesData, TimeScale,
    TimeScaleFunction, TimeSeries, TimeSeriesMetadata, TimeSeriesTuple,
};
pub use source::{DataDisposition, DataSource, DatasetOrientation};
