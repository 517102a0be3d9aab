//! Time-series model: metadata, events and ensembles.
//!
//! The `Display` implementations here are the canonical serialization used
//! for content hashing. They must render every semantically significant
//! field in a stable order; changing them changes every source hash.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{DataSource, TsError, TsResult};

/// Kind of reference time attached to a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceTimeType {
    T0,
    AnalysisStartTime,
    IssuedTime,
    LatestObservation,
    Unknown,
}

impl ReferenceTimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceTimeType::T0 => "T0",
            ReferenceTimeType::AnalysisStartTime => "ANALYSIS_START_TIME",
            ReferenceTimeType::IssuedTime => "ISSUED_TIME",
            ReferenceTimeType::LatestObservation => "LATEST_OBSERVATION",
            ReferenceTimeType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ReferenceTimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic feature a series describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub description: Option<String>,
    pub srid: Option<i32>,
    pub wkt: Option<String>,
}

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            srid: None,
            wkt: None,
        }
    }

    pub fn with_geometry(mut self, srid: i32, wkt: impl Into<String>) -> Self {
        self.srid = Some(srid);
        self.wkt = Some(wkt.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Feature{{name={}, description={}, srid={}, wkt={}}}",
            self.name,
            self.description.as_deref().unwrap_or(""),
            self.srid.map(|s| s.to_string()).unwrap_or_default(),
            self.wkt.as_deref().unwrap_or("")
        )
    }
}

/// Aggregation applied over a time-scale period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeScaleFunction {
    Mean,
    Minimum,
    Maximum,
    Total,
    Unknown,
}

impl TimeScaleFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeScaleFunction::Mean => "MEAN",
            TimeScaleFunction::Minimum => "MINIMUM",
            TimeScaleFunction::Maximum => "MAXIMUM",
            TimeScaleFunction::Total => "TOTAL",
            TimeScaleFunction::Unknown => "UNKNOWN",
        }
    }
}

/// Period and function over which each value was aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeScale {
    pub period_minutes: i64,
    pub function: TimeScaleFunction,
}

impl TimeScale {
    pub fn new(period_minutes: i64, function: TimeScaleFunction) -> Self {
        Self {
            period_minutes,
            function,
        }
    }
}

impl fmt::Display for TimeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TimeScale{{period=PT{}M, function={}}}",
            self.period_minutes,
            self.function.as_str()
        )
    }
}

/// Descriptive state shared by every event of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesMetadata {
    pub reference_times: BTreeMap<ReferenceTimeType, DateTime<Utc>>,
    pub time_scale: Option<TimeScale>,
    pub variable_name: String,
    pub feature: Feature,
    pub unit: String,
}

impl TimeSeriesMetadata {
    pub fn new(variable_name: impl Into<String>, feature: Feature, unit: impl Into<String>) -> Self {
        Self {
            reference_times: BTreeMap::new(),
            time_scale: None,
            variable_name: variable_name.into(),
            feature,
            unit: unit.into(),
        }
    }

    pub fn with_reference_time(mut self, kind: ReferenceTimeType, time: DateTime<Utc>) -> Self {
        self.reference_times.insert(kind, time);
        self
    }

    pub fn with_time_scale(mut self, time_scale: TimeScale) -> Self {
        self.time_scale = Some(time_scale);
        self
    }
}

impl fmt::Display for TimeSeriesMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TimeSeriesMetadata{reference_times={")?;
        for (i, (kind, time)) in self.reference_times.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", kind, format_instant(time))?;
        }
        write!(f, "}}, time_scale=")?;
        match &self.time_scale {
            Some(scale) => write!(f, "{}", scale)?,
            None => f.write_str("none")?,
        }
        write!(
            f,
            ", variable={}, feature={}, unit={}}}",
            self.variable_name, self.feature, self.unit
        )
    }
}

/// A single (valid time, value) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    pub valid_time: DateTime<Utc>,
    pub value: T,
}

impl<T> Event<T> {
    pub fn new(valid_time: DateTime<Utc>, value: T) -> Self {
        Self { valid_time, value }
    }
}

/// One labelled member value of an ensemble event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMember {
    pub label: String,
    pub value: f64,
}

/// Ensemble event value: one value per labelled member, in member order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ensemble {
    members: Vec<EnsembleMember>,
}

impl Ensemble {
    /// Build an ensemble value from labelled members. Labels must be unique.
    pub fn new<I, L>(members: I) -> TsResult<Self>
    where
        I: IntoIterator<Item = (L, f64)>,
        L: Into<String>,
    {
        let members: Vec<EnsembleMember> = members
            .into_iter()
            .map(|(label, value)| EnsembleMember {
                label: label.into(),
                value,
            })
            .collect();

        for (i, member) in members.iter().enumerate() {
            if members[..i].iter().any(|m| m.label == member.label) {
                return Err(TsError::InvalidSeries(format!(
                    "duplicate ensemble member label '{}'",
                    member.label
                )));
            }
        }

        Ok(Self { members })
    }

    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.label.as_str())
    }

    /// Apply `f` to every member value.
    pub fn map_values(self, mut f: impl FnMut(f64) -> f64) -> Self {
        Self {
            members: self
                .members
                .into_iter()
                .map(|m| EnsembleMember {
                    label: m.label,
                    value: f(m.value),
                })
                .collect(),
        }
    }
}

impl fmt::Display for Ensemble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ensemble{")?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", member.label, member.value)?;
        }
        f.write_str("}")
    }
}

/// A fully materialised time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries<T> {
    metadata: TimeSeriesMetadata,
    events: BTreeMap<DateTime<Utc>, T>,
}

impl<T> TimeSeries<T> {
    pub fn new(metadata: TimeSeriesMetadata) -> Self {
        Self {
            metadata,
            events: BTreeMap::new(),
        }
    }

    /// Build a series from events. Two events at the same valid time are
    /// rejected.
    pub fn from_events(
        metadata: TimeSeriesMetadata,
        events: impl IntoIterator<Item = Event<T>>,
    ) -> TsResult<Self> {
        let mut series = Self::new(metadata);
        for event in events {
            series.add_event(event)?;
        }
        Ok(series)
    }

    pub fn add_event(&mut self, event: Event<T>) -> TsResult<()> {
        if self.events.contains_key(&event.valid_time) {
            return Err(TsError::InvalidSeries(format!(
                "duplicate event at {}",
                format_instant(&event.valid_time)
            )));
        }
        self.events.insert(event.valid_time, event.value);
        Ok(())
    }

    pub fn metadata(&self) -> &TimeSeriesMetadata {
        &self.metadata
    }

    /// Events ordered by valid time.
    pub fn events(&self) -> impl Iterator<Item = (&DateTime<Utc>, &T)> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn map_values<U>(self, mut f: impl FnMut(T) -> U) -> TimeSeries<U> {
        TimeSeries {
            metadata: self.metadata,
            events: self.events.into_iter().map(|(t, v)| (t, f(v))).collect(),
        }
    }
}

impl TimeSeries<Ensemble> {
    /// Split an ensemble series into one trace per member label, in the
    /// member order of the first event.
    pub fn traces(&self) -> TsResult<Vec<(String, Vec<(DateTime<Utc>, f64)>)>> {
        let Some((_, first)) = self.events.iter().next() else {
            return Ok(Vec::new());
        };

        let mut traces: Vec<(String, Vec<(DateTime<Utc>, f64)>)> = first
            .labels()
            .map(|label| (label.to_string(), Vec::with_capacity(self.events.len())))
            .collect();

        for (time, ensemble) in &self.events {
            if ensemble.members().len() != traces.len() {
                return Err(TsError::InvalidSeries(format!(
                    "ensemble at {} has {} members, expected {}",
                    format_instant(time),
                    ensemble.members().len(),
                    traces.len()
                )));
            }
            for member in ensemble.members() {
                let trace = traces
                    .iter_mut()
                    .find(|(label, _)| *label == member.label)
                    .ok_or_else(|| {
                        TsError::InvalidSeries(format!(
                            "unexpected ensemble member '{}' at {}",
                            member.label,
                            format_instant(time)
                        ))
                    })?;
                trace.1.push((*time, member.value));
            }
        }

        Ok(traces)
    }
}

impl<T: fmt::Display> fmt::Display for TimeSeries<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeSeries{{metadata={}, events=[", self.metadata)?;
        for (i, (time, value)) in self.events.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", format_instant(time), value)?;
        }
        f.write_str("]}")
    }
}

/// Series payload produced by a reader.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesData {
    SingleValued(TimeSeries<f64>),
    Ensemble(TimeSeries<Ensemble>),
}

impl SeriesData {
    pub fn metadata(&self) -> &TimeSeriesMetadata {
        match self {
            SeriesData::SingleValued(series) => series.metadata(),
            SeriesData::Ensemble(series) => series.metadata(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SeriesData::SingleValued(series) => series.len(),
            SeriesData::Ensemble(series) => series.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A series paired with the concrete source it was read from.
#[derive(Debug, Clone)]
pub struct TimeSeriesTuple {
    pub series: SeriesData,
    pub data_source: DataSource,
}

impl TimeSeriesTuple {
    pub fn new(series: SeriesData, data_source: DataSource) -> Self {
        Self {
            series,
            data_source,
        }
    }
}

fn format_instant(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 1, hour, 0, 0).unwrap()
    }

    fn metadata() -> TimeSeriesMetadata {
        TimeSeriesMetadata::new("streamflow", Feature::new("DRRC2"), "CMS")
            .with_reference_time(ReferenceTimeType::T0, at(0))
    }

    #[test]
    fn test_duplicate_event_rejected() {
        let result = TimeSeries::from_events(
            metadata(),
            vec![Event::new(at(1), 1.0), Event::new(at(1), 2.0)],
        );
        assert!(matches!(result, Err(TsError::InvalidSeries(_))));
    }

    #[test]
    fn test_display_is_ordered_by_valid_time() {
        let series = TimeSeries::from_events(
            metadata(),
            vec![Event::new(at(2), 2.5), Event::new(at(1), 30.0)],
        )
        .unwrap();
        let text = series.to_string();
        let first = text.find("2023-04-01T01:00:00Z=30").unwrap();
        let second = text.find("2023-04-01T02:00:00Z=2.5").unwrap();
        assert!(first < second);
        assert!(text.contains("T0=2023-04-01T00:00:00Z"));
        assert!(text.contains("variable=streamflow"));
    }

    #[test]
    fn test_duplicate_ensemble_label_rejected() {
        assert!(Ensemble::new(vec![("123", 1.0), ("123", 2.0)]).is_err());
    }

    #[test]
    fn test_traces_split_members() {
        let events = (1..=3).map(|h| {
            Event::new(
                at(h),
                Ensemble::new(vec![("123", h as f64), ("456", 10.0 * h as f64)]).unwrap(),
            )
        });
        let series = TimeSeries::from_events(metadata(), events).unwrap();
        let traces = series.traces().unwrap();

        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].0, "123");
        assert_eq!(traces[1].1, vec![(at(1), 10.0), (at(2), 20.0), (at(3), 30.0)]);
    }

    #[test]
    fn test_traces_reject_ragged_members() {
        let series = TimeSeries::from_events(
            metadata(),
            vec![
                Event::new(at(1), Ensemble::new(vec![("a", 1.0), ("b", 2.0)]).unwrap()),
                Event::new(at(2), Ensemble::new(vec![("a", 1.0)]).unwrap()),
            ],
        )
        .unwrap();
        assert!(series.traces().is_err());
    }
}
