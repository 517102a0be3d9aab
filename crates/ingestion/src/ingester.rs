//! Time-series ingester: deduplicates series by content, writes new ones and
//! reports what happened to each.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use storage::{
    ReferenceKeys, SourceLockManager, SourceRow, SourceStore, DEFAULT_ENSEMBLE_NAME,
};
use ts_common::missing::to_stored;
use ts_common::{
    DataSource, Ensemble, ReferenceTimeType, SeriesData, TimeSeries, TimeSeriesMetadata,
    TimeSeriesTuple,
};

use crate::completion::CompletionTracker;
use crate::config::IngestConfig;
use crate::disposition::extract_lead_minutes;
use crate::error::{IngestionError, Result};
use crate::identifier::{identify, identify_gridded};
use crate::latch::LatchPair;
use crate::reader::TimeSeriesStream;
use crate::registry::SourceRegistry;
use crate::result::{IngestResult, OrientationCounts};
use crate::writer::EventWriter;

/// (lead minutes, stored value) rows of one trace.
type TraceRows = Vec<(i32, Option<f64>)>;

/// Where a source stands in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    NotPresent,
    /// Registered and either locked by a writer or still inside the grace
    /// period
    InFlight { source_id: i64 },
    /// Incomplete, unlocked and older than the grace period
    Abandoned { source_id: i64 },
    Complete { source_id: i64 },
}

/// Ingests streams of time series into the store.
///
/// Cheap to clone; clones share the copy permits, lock manager and store.
#[derive(Clone)]
pub struct TimeSeriesIngester {
    store: Arc<dyn SourceStore>,
    keys: Arc<dyn ReferenceKeys>,
    locks: Arc<dyn SourceLockManager>,
    registry: Arc<SourceRegistry>,
    writer: Arc<EventWriter>,
    completion: Arc<CompletionTracker>,
    config: Arc<IngestConfig>,
}

impl TimeSeriesIngester {
    pub fn new(
        store: Arc<dyn SourceStore>,
        keys: Arc<dyn ReferenceKeys>,
        locks: Arc<dyn SourceLockManager>,
        config: IngestConfig,
    ) -> Self {
        let writer = Arc::new(EventWriter::new(
            Arc::clone(&store),
            config.value_batch_size,
            config.max_concurrent_copies,
        ));
        let completion = Arc::new(CompletionTracker::new(Arc::clone(&store), Arc::clone(&locks)));
        let registry = Arc::new(SourceRegistry::new(Arc::clone(&store), Arc::clone(&keys)));

        Self {
            store,
            keys,
            locks,
            registry,
            writer,
            completion,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Ingest every series of a stream read from `outer`, returning one result
    /// per series. Gridded sources are registered by reference and the
    /// stream is not consumed.
    #[instrument(skip_all, fields(uri = %outer.uri()))]
    pub async fn ingest(&self, series: TimeSeriesStream, outer: &DataSource) -> Result<Vec<IngestResult>> {
        if outer.is_gridded() {
            return Ok(vec![self.ingest_gridded(outer).await?]);
        }

        let this = self.clone();
        let outcomes: Vec<Result<IngestResult>> = series
            .map(move |item| {
                let this = this.clone();
                async move {
                    let tuple = item?;
                    tokio::spawn(async move { this.ingest_with_retries(tuple).await })
                        .await
                        .map_err(|e| anyhow::anyhow!("ingest task failed: {}", e))?
                }
            })
            .buffer_unordered(self.config.max_ingest_threads)
            .collect()
            .await;

        let results = outcomes.into_iter().collect::<Result<Vec<_>>>()?;

        let retries = results.iter().filter(|r| r.requires_retry()).count();
        if retries > 0 {
            warn!(
                retries,
                "Some series are still being ingested elsewhere after exhausting retries"
            );
        }
        info!(series = results.len(), "Ingested source");
        Ok(results)
    }

    /// Report the registry state of a natural key.
    pub async fn status(&self, hash: &str) -> Result<SourceStatus> {
        let Some(row) = self.registry.find(hash).await? else {
            return Ok(SourceStatus::NotPresent);
        };
        self.status_of(&row).await
    }

    async fn status_of(&self, row: &SourceRow) -> Result<SourceStatus> {
        let source_id = row.source_id;
        if row.completed {
            return Ok(SourceStatus::Complete { source_id });
        }
        if self.locks.is_source_locked(source_id).await? {
            return Ok(SourceStatus::InFlight { source_id });
        }
        if Utc::now() - row.registered_at > self.config.abandoned_grace() {
            return Ok(SourceStatus::Abandoned { source_id });
        }
        Ok(SourceStatus::InFlight { source_id })
    }

    /// Status of a gridded source, identified by its file-level identity.
    pub async fn gridded_status(&self, source: &DataSource) -> Result<SourceStatus> {
        let hash = identify_gridded(source).await?;
        self.status(&hash).await
    }

    /// Remove a source if nobody holds it and it never completed. Returns
    /// whether it was removed.
    #[instrument(skip(self))]
    pub async fn remove_if_abandoned(&self, source_id: i64) -> Result<bool> {
        if !self.locks.try_lock_source(source_id).await? {
            debug!("Source is locked, leaving it");
            return Ok(false);
        }

        let removed = self.remove_locked(source_id).await;
        self.locks.unlock_source(source_id).await?;

        let removed = removed?;
        if removed {
            info!("Removed abandoned source");
        }
        Ok(removed)
    }

    async fn remove_locked(&self, source_id: i64) -> Result<bool> {
        if self.store.was_completed(source_id).await? {
            return Ok(false);
        }
        Ok(self.store.remove_source(source_id).await?)
    }

    /// Remove every abandoned source in the store.
    pub async fn remove_abandoned(&self) -> Result<Vec<SourceRow>> {
        let mut removed = Vec::new();
        for row in self.store.incomplete_sources().await? {
            if let SourceStatus::Abandoned { source_id } = self.status_of(&row).await? {
                if self.remove_if_abandoned(source_id).await? {
                    removed.push(row);
                }
            }
        }
        Ok(removed)
    }

    async fn ingest_with_retries(&self, tuple: TimeSeriesTuple) -> Result<IngestResult> {
        let mut result = self.ingest_one(&tuple).await?;

        let mut attempt = 0;
        while result.requires_retry() && attempt < self.config.max_retries {
            let delay = self.config.retry_backoff(attempt);
            debug!(
                source_id = result.source_id(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Source in flight elsewhere, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            result = self.ingest_one(&tuple).await?;
        }

        if result.requires_retry() {
            warn!(
                source_id = result.source_id(),
                uri = %tuple.data_source.uri(),
                attempts = attempt,
                "Giving up on source still in flight"
            );
        }
        Ok(result)
    }

    async fn ingest_one(&self, tuple: &TimeSeriesTuple) -> Result<IngestResult> {
        let source = &tuple.data_source;
        OrientationCounts::from_source(source)?;

        match &tuple.series {
            SeriesData::SingleValued(series) => self.ingest_single_valued(series, source).await,
            SeriesData::Ensemble(series) => self.ingest_ensemble(series, source).await,
        }
    }

    #[instrument(skip_all, fields(uri = %source.uri(), events = series.len()))]
    async fn ingest_single_valued(&self, series: &TimeSeries<f64>, source: &DataSource) -> Result<IngestResult> {
        let uri = source.uri();
        let reference = single_reference_time(series.metadata(), uri)?;
        if series.is_empty() {
            return Err(IngestionError::pre_ingest(uri, "time series has no events"));
        }

        let rows = trace_rows(series.events().map(|(t, v)| (*t, *v)), reference.1, uri)?;
        let hash = identify(series, uri)?;

        let traces = vec![(DEFAULT_ENSEMBLE_NAME.to_string(), rows)];
        self.ingest_traces(&hash, series.metadata(), reference, traces, source)
            .await
    }

    #[instrument(skip_all, fields(uri = %source.uri(), events = series.len()))]
    async fn ingest_ensemble(&self, series: &TimeSeries<Ensemble>, source: &DataSource) -> Result<IngestResult> {
        let uri = source.uri();
        let reference = single_reference_time(series.metadata(), uri)?;
        if series.is_empty() {
            return Err(IngestionError::pre_ingest(uri, "time series has no events"));
        }

        let traces = series
            .traces()
            .map_err(|e| IngestionError::pre_ingest(uri, e))?
            .into_iter()
            .map(|(label, events)| Ok((label, trace_rows(events, reference.1, uri)?)))
            .collect::<Result<Vec<_>>>()?;
        let hash = identify(series, uri)?;

        self.ingest_traces(&hash, series.metadata(), reference, traces, source)
            .await
    }

    async fn ingest_traces(
        &self,
        hash: &str,
        metadata: &TimeSeriesMetadata,
        reference: (ReferenceTimeType, DateTime<Utc>),
        traces: Vec<(String, TraceRows)>,
        source: &DataSource,
    ) -> Result<IngestResult> {
        let registered = self
            .registry
            .register_series(hash, metadata, source.uri())
            .await?;

        if !registered.inserted {
            return self.finalize_existing(hash, registered.source_id, source).await;
        }

        let source_id = registered.source_id;
        self.lock_for_write(source_id, source.uri()).await?;
        let written = self.write_traces(source_id, reference, traces).await;
        self.release_on_failure(source_id, source.uri(), written).await?;

        IngestResult::new(source, source_id, false, false)
    }

    #[instrument(skip_all, fields(uri = %source.uri()))]
    async fn ingest_gridded(&self, source: &DataSource) -> Result<IngestResult> {
        OrientationCounts::from_source(source)?;

        let hash = identify_gridded(source).await?;
        let lead_minutes = extract_lead_minutes(source.uri());
        let registered = self
            .registry
            .register_gridded(&hash, source, lead_minutes)
            .await?;

        if !registered.inserted {
            return self.finalize_existing(&hash, registered.source_id, source).await;
        }

        let source_id = registered.source_id;
        self.lock_for_write(source_id, source.uri()).await?;
        let written = self
            .completion
            .mark_complete(source_id, &self.writer.for_source(), &[])
            .await;
        self.release_on_failure(source_id, source.uri(), written).await?;

        IngestResult::new(source, source_id, false, false)
    }

    async fn lock_for_write(&self, source_id: i64, uri: &str) -> Result<()> {
        self.locks
            .lock_source(source_id)
            .await
            .map_err(|e| IngestionError::ingest(uri, e))
    }

    /// A failed write releases the lock so the incomplete source can later be
    /// recognised as abandoned.
    async fn release_on_failure(&self, source_id: i64, uri: &str, written: Result<()>) -> Result<()> {
        let Err(e) = written else {
            return Ok(());
        };
        if let Err(unlock) = self.locks.unlock_source(source_id).await {
            warn!(source_id, error = %unlock, "Failed to release lock after ingest failure");
        }
        Err(IngestionError::ingest(uri, e))
    }

    async fn write_traces(
        &self,
        source_id: i64,
        reference: (ReferenceTimeType, DateTime<Utc>),
        traces: Vec<(String, TraceRows)>,
    ) -> Result<()> {
        let (kind, time) = reference;
        self.store.insert_reference_time(source_id, kind, time).await?;

        let writer = self.writer.for_source();
        let mut latches: Vec<LatchPair> = Vec::new();
        for (label, rows) in traces {
            let ensemble_id = self.keys.ensemble_id(&label).await?;
            let time_series_id = self.store.insert_time_series(source_id, ensemble_id).await?;
            for (lead, value) in rows {
                latches.push(writer.write(time_series_id, lead, value)?);
            }
        }

        debug!(source_id, writes = latches.len(), "Dispatched value writes");
        self.completion.mark_complete(source_id, &writer, &latches).await
    }

    /// The source was registered before this call: report it found, or ask
    /// for a retry while another task holds it or after removing it.
    async fn finalize_existing(&self, hash: &str, source_id: i64, source: &DataSource) -> Result<IngestResult> {
        match self.status(hash).await? {
            SourceStatus::Complete { .. } => IngestResult::new(source, source_id, true, false),
            SourceStatus::Abandoned { source_id } => {
                warn!(source_id, uri = %source.uri(), "Found abandoned source");
                self.remove_if_abandoned(source_id).await?;
                IngestResult::new(source, source_id, true, true)
            }
            SourceStatus::InFlight { .. } | SourceStatus::NotPresent => {
                IngestResult::new(source, source_id, true, true)
            }
        }
    }
}

/// The single reference time a series is stored against.
fn single_reference_time(
    metadata: &TimeSeriesMetadata,
    uri: &str,
) -> Result<(ReferenceTimeType, DateTime<Utc>)> {
    let mut times = metadata.reference_times.iter();
    match (times.next(), times.next()) {
        (Some((kind, time)), None) => Ok((*kind, *time)),
        _ => Err(IngestionError::pre_ingest(
            uri,
            format!(
                "expected exactly one reference time, found {}",
                metadata.reference_times.len()
            ),
        )),
    }
}

/// Leads in whole minutes from `reference`, with missing values as `None`.
/// Two events truncating to the same lead are rejected.
fn trace_rows(
    events: impl IntoIterator<Item = (DateTime<Utc>, f64)>,
    reference: DateTime<Utc>,
    uri: &str,
) -> Result<TraceRows> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .map(|(valid_time, value)| {
            let minutes = (valid_time - reference).num_minutes();
            let lead = i32::try_from(minutes).map_err(|_| {
                IngestionError::pre_ingest(
                    uri,
                    format!("lead of {} minutes at {} does not fit", minutes, valid_time),
                )
            })?;
            if !seen.insert(lead) {
                return Err(IngestionError::pre_ingest(
                    uri,
                    format!("more than one event at lead {} minutes ({})", lead, valid_time),
                ));
            }
            Ok((lead, to_stored(value)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::{forecast_metadata, metadata_without_reference_time, reference_time, valid_time};
    use ts_common::MISSING_VALUE;

    #[test]
    fn test_single_reference_time_required() {
        assert_eq!(
            single_reference_time(&forecast_metadata(), "a").unwrap(),
            (ReferenceTimeType::T0, reference_time())
        );
        assert!(matches!(
            single_reference_time(&metadata_without_reference_time(), "a"),
            Err(IngestionError::PreIngest { .. })
        ));

        let two = forecast_metadata().with_reference_time(ReferenceTimeType::IssuedTime, reference_time());
        assert!(single_reference_time(&two, "a").is_err());
    }

    #[test]
    fn test_trace_rows_truncate_to_minutes() {
        let events = vec![
            (valid_time(60), 30.0),
            (valid_time(90) + chrono::Duration::seconds(59), MISSING_VALUE),
            (valid_time(-30), 1.0),
        ];
        let rows = trace_rows(events, reference_time(), "a").unwrap();
        assert_eq!(rows, vec![(60, Some(30.0)), (90, None), (-30, Some(1.0))]);
    }

    #[test]
    fn test_trace_rows_reject_events_in_the_same_minute() {
        let events = vec![
            (valid_time(60) + chrono::Duration::seconds(10), 30.0),
            (valid_time(60) + chrono::Duration::seconds(50), 99.0),
        ];
        let err = trace_rows(events, reference_time(), "a").unwrap_err();
        assert!(matches!(err, IngestionError::PreIngest { .. }));
    }

    #[test]
    fn test_trace_rows_lead_overflow() {
        let far = reference_time() + chrono::Duration::minutes(i64::from(i32::MAX) + 1);
        let err = trace_rows(vec![(far, 1.0)], reference_time(), "a").unwrap_err();
        assert!(matches!(err, IngestionError::PreIngest { .. }));
    }
}
