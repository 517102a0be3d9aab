//! Source descriptors handed from the loader to the ingester.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::{DeclaredSource, TsError};

/// Role a dataset plays in an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetOrientation {
    Left,
    Right,
    Baseline,
    Covariate,
}

impl DatasetOrientation {
    pub const ALL: [DatasetOrientation; 4] = [
        DatasetOrientation::Left,
        DatasetOrientation::Right,
        DatasetOrientation::Baseline,
        DatasetOrientation::Covariate,
    ];
}

impl fmt::Display for DatasetOrientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatasetOrientation::Left => "LEFT",
            DatasetOrientation::Right => "RIGHT",
            DatasetOrientation::Baseline => "BASELINE",
            DatasetOrientation::Covariate => "COVARIATE",
        };
        f.write_str(name)
    }
}

/// Detected content type of a concrete source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataDisposition {
    /// Gzip-compressed stream wrapping another disposition
    Gzip,
    /// Tar archive of other sources
    Tarball,
    XmlPiTimeseries,
    XmlFiTimeseries,
    Datacard,
    /// NetCDF grid, ingested by reference
    NetcdfGridded,
    NetcdfVector,
    JsonWrdsNwm,
    JsonWrdsAhps,
    JsonWaterml,
    CsvWres,
    /// Not (yet) detected
    Unknown,
}

impl DataDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataDisposition::Gzip => "GZIP",
            DataDisposition::Tarball => "TARBALL",
            DataDisposition::XmlPiTimeseries => "XML_PI_TIMESERIES",
            DataDisposition::XmlFiTimeseries => "XML_FI_TIMESERIES",
            DataDisposition::Datacard => "DATACARD",
            DataDisposition::NetcdfGridded => "NETCDF_GRIDDED",
            DataDisposition::NetcdfVector => "NETCDF_VECTOR",
            DataDisposition::JsonWrdsNwm => "JSON_WRDS_NWM",
            DataDisposition::JsonWrdsAhps => "JSON_WRDS_AHPS",
            DataDisposition::JsonWaterml => "JSON_WATERML",
            DataDisposition::CsvWres => "CSV_WRES",
            DataDisposition::Unknown => "UNKNOWN",
        }
    }

    /// Archives must be decomposed into their members before ingest.
    pub fn is_archive(&self) -> bool {
        matches!(self, DataDisposition::Gzip | DataDisposition::Tarball)
    }
}

impl fmt::Display for DataDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataDisposition {
    type Err = TsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let disposition = match s.to_uppercase().as_str() {
            "GZIP" => DataDisposition::Gzip,
            "TARBALL" => DataDisposition::Tarball,
            "XML_PI_TIMESERIES" => DataDisposition::XmlPiTimeseries,
            "XML_FI_TIMESERIES" => DataDisposition::XmlFiTimeseries,
            "DATACARD" => DataDisposition::Datacard,
            "NETCDF_GRIDDED" => DataDisposition::NetcdfGridded,
            "NETCDF_VECTOR" => DataDisposition::NetcdfVector,
            "JSON_WRDS_NWM" => DataDisposition::JsonWrdsNwm,
            "JSON_WRDS_AHPS" => DataDisposition::JsonWrdsAhps,
            "JSON_WATERML" => DataDisposition::JsonWaterml,
            "CSV_WRES" => DataDisposition::CsvWres,
            "UNKNOWN" => DataDisposition::Unknown,
            _ => return Err(TsError::UnknownDisposition(s.to_string())),
        };
        Ok(disposition)
    }
}

/// A concrete source of time-series data.
///
/// Identical declared sources used in several orientations collapse into one
/// `DataSource`: `orientation` is where it was first declared and `links`
/// holds the others.
#[derive(Debug, Clone)]
pub struct DataSource {
    disposition: DataDisposition,
    uri: String,
    orientation: DatasetOrientation,
    links: Vec<DatasetOrientation>,
    declared: Arc<DeclaredSource>,
}

impl DataSource {
    pub fn new(
        disposition: DataDisposition,
        uri: impl Into<String>,
        orientation: DatasetOrientation,
        links: Vec<DatasetOrientation>,
        declared: Arc<DeclaredSource>,
    ) -> Self {
        Self {
            disposition,
            uri: uri.into(),
            orientation,
            links,
            declared,
        }
    }

    pub fn disposition(&self) -> DataDisposition {
        self.disposition
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn orientation(&self) -> DatasetOrientation {
        self.orientation
    }

    pub fn links(&self) -> &[DatasetOrientation] {
        &self.links
    }

    pub fn declared(&self) -> &DeclaredSource {
        &self.declared
    }

    /// A copy of this source with a different disposition, e.g. once
    /// detection has run.
    pub fn with_disposition(&self, disposition: DataDisposition) -> Self {
        Self {
            disposition,
            ..self.clone()
        }
    }

    /// A child source (archive member) that inherits orientation, links and
    /// declaration from this one.
    pub fn child(&self, uri: impl Into<String>, disposition: DataDisposition) -> Self {
        Self {
            disposition,
            uri: uri.into(),
            ..self.clone()
        }
    }

    pub fn is_gridded(&self) -> bool {
        self.disposition == DataDisposition::NetcdfGridded
    }

    pub fn is_web(&self) -> bool {
        let lower = self.uri.to_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }

    /// Local filesystem path, when the URI names one.
    pub fn path(&self) -> Option<PathBuf> {
        if self.is_web() {
            return None;
        }
        let path = self.uri.strip_prefix("file://").unwrap_or(&self.uri);
        Some(PathBuf::from(path))
    }

    /// Number of times the source occurs in the given orientation, counting
    /// the primary orientation and every link.
    pub fn occurrences(&self, orientation: DatasetOrientation) -> usize {
        let primary = usize::from(self.orientation == orientation);
        primary + self.links.iter().filter(|o| **o == orientation).count()
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.uri, self.disposition, self.orientation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared() -> Arc<DeclaredSource> {
        Arc::new(DeclaredSource::new("/data/obs"))
    }

    #[test]
    fn test_disposition_round_trip_names() {
        for name in ["GZIP", "csv_wres", "NetCDF_Gridded", "UNKNOWN"] {
            let parsed: DataDisposition = name.parse().expect("known disposition");
            assert_eq!(parsed.as_str(), name.to_uppercase());
        }
        assert!("PARQUET".parse::<DataDisposition>().is_err());
    }

    #[test]
    fn test_occurrences_counts_links() {
        let source = DataSource::new(
            DataDisposition::CsvWres,
            "/data/obs/a.csv",
            DatasetOrientation::Left,
            vec![DatasetOrientation::Baseline, DatasetOrientation::Left],
            declared(),
        );
        assert_eq!(source.occurrences(DatasetOrientation::Left), 2);
        assert_eq!(source.occurrences(DatasetOrientation::Baseline), 1);
        assert_eq!(source.occurrences(DatasetOrientation::Right), 0);
    }

    #[test]
    fn test_path_and_web_detection() {
        let local = DataSource::new(
            DataDisposition::Datacard,
            "file:///data/obs/a.card",
            DatasetOrientation::Left,
            Vec::new(),
            declared(),
        );
        assert_eq!(local.path(), Some(PathBuf::from("/data/obs/a.card")));
        assert!(!local.is_web());

        let web = local.child("https://example.org/nwm?site=1", DataDisposition::JsonWrdsNwm);
        assert!(web.is_web());
        assert!(web.path().is_none());
        assert_eq!(web.orientation(), DatasetOrientation::Left);
    }

    #[test]
    fn test_gridded() {
        let source = DataSource::new(
            DataDisposition::NetcdfGridded,
            "/data/grid_f003.nc",
            DatasetOrientation::Right,
            Vec::new(),
            declared(),
        );
        assert!(source.is_gridded());
        assert!(!source.with_disposition(DataDisposition::NetcdfVector).is_gridded());
    }
}
