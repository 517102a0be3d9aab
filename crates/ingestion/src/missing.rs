//! Missing-value normalisation of series read from a source.

use ts_common::{DataSource, SeriesData, TimeSeriesTuple, MISSING_VALUE};

/// Maps the sentinel values declared for a source onto the canonical
/// missing marker. Values not exactly equal to a sentinel pass through.
#[derive(Debug, Clone, Default)]
pub struct MissingValueNormalizer {
    sentinels: Vec<f64>,
}

impl MissingValueNormalizer {
    pub fn new(sentinels: &[f64]) -> Self {
        Self {
            sentinels: sentinels.to_vec(),
        }
    }

    pub fn for_source(source: &DataSource) -> Self {
        Self::new(&source.declared().missing_values)
    }

    pub fn is_empty(&self) -> bool {
        self.sentinels.is_empty()
    }

    pub fn normalize_value(&self, value: f64) -> f64 {
        if self.sentinels.iter().any(|s| *s == value) {
            MISSING_VALUE
        } else {
            value
        }
    }

    pub fn normalize(&self, tuple: TimeSeriesTuple) -> TimeSeriesTuple {
        if self.is_empty() {
            return tuple;
        }

        let series = match tuple.series {
            SeriesData::SingleValued(series) => {
                SeriesData::SingleValued(series.map_values(|v| self.normalize_value(v)))
            }
            SeriesData::Ensemble(series) => SeriesData::Ensemble(
                series.map_values(|e| e.map_values(|v| self.normalize_value(v))),
            ),
        };

        TimeSeriesTuple::new(series, tuple.data_source)
    }
}
