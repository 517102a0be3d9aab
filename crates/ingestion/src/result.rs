//! Outcome of ingesting one time series (or one gridded source).

use serde::Serialize;

use ts_common::{DataSource, DatasetOrientation};

use crate::error::{IngestionError, Result};

/// How many times a source occurs in each orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OrientationCounts {
    pub left: u8,
    pub right: u8,
    pub baseline: u8,
    pub covariate: u8,
}

impl OrientationCounts {
    /// Count the primary orientation and links of a source. A count that
    /// does not fit is an error, never a wraparound.
    pub fn from_source(source: &DataSource) -> Result<Self> {
        let count = |orientation| {
            let occurrences = source.occurrences(orientation);
            u8::try_from(occurrences).map_err(|_| IngestionError::OccurrenceOverflow {
                orientation,
                count: occurrences,
                max: u8::MAX,
            })
        };

        Ok(Self {
            left: count(DatasetOrientation::Left)?,
            right: count(DatasetOrientation::Right)?,
            baseline: count(DatasetOrientation::Baseline)?,
            covariate: count(DatasetOrientation::Covariate)?,
        })
    }

    pub fn get(&self, orientation: DatasetOrientation) -> u8 {
        match orientation {
            DatasetOrientation::Left => self.left,
            DatasetOrientation::Right => self.right,
            DatasetOrientation::Baseline => self.baseline,
            DatasetOrientation::Covariate => self.covariate,
        }
    }
}

/// Immutable ingest outcome keyed by the source's surrogate id.
#[derive(Debug, Clone)]
pub enum IngestResult {
    /// Terminal: the source is ingested, by this call or an earlier one.
    Compact {
        source_id: i64,
        found_already: bool,
        counts: OrientationCounts,
    },
    /// Another task holds the source, or it was abandoned and removed; the
    /// caller should come back later with the carried source.
    NeedingRetry {
        source_id: i64,
        counts: OrientationCounts,
        data_source: DataSource,
    },
}

impl IngestResult {
    /// Build a result, validating the combination of flags and the
    /// occurrence counts of the source.
    pub fn new(
        data_source: &DataSource,
        source_id: i64,
        found_already: bool,
        requires_retry: bool,
    ) -> Result<Self> {
        if requires_retry && !found_already {
            return Err(IngestionError::InvalidResult(format!(
                "source {} cannot need a retry when it was not found already",
                source_id
            )));
        }

        let counts = OrientationCounts::from_source(data_source)?;

        Ok(if requires_retry {
            IngestResult::NeedingRetry {
                source_id,
                counts,
                data_source: data_source.clone(),
            }
        } else {
            IngestResult::Compact {
                source_id,
                found_already,
                counts,
            }
        })
    }

    pub fn source_id(&self) -> i64 {
        match self {
            IngestResult::Compact { source_id, .. } | IngestResult::NeedingRetry { source_id, .. } => {
                *source_id
            }
        }
    }

    pub fn found_already(&self) -> bool {
        match self {
            IngestResult::Compact { found_already, .. } => *found_already,
            IngestResult::NeedingRetry { .. } => true,
        }
    }

    pub fn requires_retry(&self) -> bool {
        matches!(self, IngestResult::NeedingRetry { .. })
    }

    pub fn counts(&self) -> OrientationCounts {
        match self {
            IngestResult::Compact { counts, .. } | IngestResult::NeedingRetry { counts, .. } => {
                *counts
            }
        }
    }

    pub fn left_count(&self) -> u8 {
        self.counts().left
    }

    pub fn right_count(&self) -> u8 {
        self.counts().right
    }

    pub fn baseline_count(&self) -> u8 {
        self.counts().baseline
    }

    pub fn covariate_count(&self) -> u8 {
        self.counts().covariate
    }

    /// The source to re-attempt; only present when a retry is needed.
    pub fn data_source(&self) -> Option<&DataSource> {
        match self {
            IngestResult::NeedingRetry { data_source, .. } => Some(data_source),
            IngestResult::Compact { .. } => None,
        }
    }
}
