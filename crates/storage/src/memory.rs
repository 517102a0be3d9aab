//! In-process store for single-process runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use ts_common::{Feature, ReferenceTimeType, TimeScale, TsError, TsResult};

use crate::store::{
    ReferenceKeys, RegisteredSource, SourceRecord, SourceRow, SourceStore, ValueRow,
};

struct StoredSource {
    record: SourceRecord,
    registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    sources: BTreeMap<i64, StoredSource>,
    by_hash: HashMap<String, i64>,
    reference_times: BTreeMap<(i64, ReferenceTimeType), DateTime<Utc>>,
    /// time series id -> (source id, ensemble id)
    time_series: BTreeMap<i64, (i64, i64)>,
    values: BTreeMap<(i64, i32), Option<f64>>,
    completed: HashSet<i64>,
    keys: HashMap<String, i64>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn key(&mut self, natural_key: String) -> i64 {
        if let Some(id) = self.keys.get(&natural_key) {
            return *id;
        }
        let id = self.next_id();
        self.keys.insert(natural_key, id);
        id
    }

    fn row(&self, source_id: i64, stored: &StoredSource) -> SourceRow {
        SourceRow {
            source_id,
            hash: stored.record.hash.clone(),
            path: stored.record.path.clone(),
            registered_at: stored.registered_at,
            completed: self.completed.contains(&source_id),
        }
    }
}

/// A [`SourceStore`] and [`ReferenceKeys`] held entirely in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<MemoryState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> TsResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| TsError::InternalError("memory catalog lock poisoned".to_string()))
    }

    /// Number of registered sources.
    pub fn source_count(&self) -> TsResult<usize> {
        Ok(self.state()?.sources.len())
    }

    /// Attributes a source was registered with.
    pub fn source_record(&self, source_id: i64) -> TsResult<Option<SourceRecord>> {
        Ok(self
            .state()?
            .sources
            .get(&source_id)
            .map(|s| s.record.clone()))
    }

    /// Time-series ids under a source, as (time series id, ensemble id).
    pub fn time_series_for(&self, source_id: i64) -> TsResult<Vec<(i64, i64)>> {
        Ok(self
            .state()?
            .time_series
            .iter()
            .filter(|(_, (source, _))| *source == source_id)
            .map(|(id, (_, ensemble))| (*id, *ensemble))
            .collect())
    }

    /// Value rows of one time series ordered by lead.
    pub fn values_for(&self, time_series_id: i64) -> TsResult<Vec<(i32, Option<f64>)>> {
        Ok(self
            .state()?
            .values
            .range((time_series_id, i32::MIN)..=(time_series_id, i32::MAX))
            .map(|((_, lead), value)| (*lead, *value))
            .collect())
    }

    /// Total value rows across every series.
    pub fn value_count(&self) -> TsResult<usize> {
        Ok(self.state()?.values.len())
    }

    pub fn reference_times_for(
        &self,
        source_id: i64,
    ) -> TsResult<Vec<(ReferenceTimeType, DateTime<Utc>)>> {
        Ok(self
            .state()?
            .reference_times
            .iter()
            .filter(|((source, _), _)| *source == source_id)
            .map(|((_, kind), time)| (*kind, *time))
            .collect())
    }
}

#[async_trait]
impl SourceStore for MemoryCatalog {
    async fn register_source(&self, record: &SourceRecord) -> TsResult<RegisteredSource> {
        let mut state = self.state()?;

        if let Some(source_id) = state.by_hash.get(&record.hash) {
            return Ok(RegisteredSource {
                source_id: *source_id,
                inserted: false,
            });
        }

        let source_id = state.next_id();
        state.by_hash.insert(record.hash.clone(), source_id);
        state.sources.insert(
            source_id,
            StoredSource {
                record: record.clone(),
                registered_at: Utc::now(),
            },
        );

        Ok(RegisteredSource {
            source_id,
            inserted: true,
        })
    }

    async fn find_source(&self, hash: &str) -> TsResult<Option<SourceRow>> {
        let state = self.state()?;
        Ok(state
            .by_hash
            .get(hash)
            .and_then(|id| state.sources.get(id).map(|s| state.row(*id, s))))
    }

    async fn insert_reference_time(
        &self,
        source_id: i64,
        kind: ReferenceTimeType,
        time: DateTime<Utc>,
    ) -> TsResult<()> {
        let mut state = self.state()?;
        if !state.sources.contains_key(&source_id) {
            return Err(TsError::SourceNotFound(source_id));
        }
        state.reference_times.entry((source_id, kind)).or_insert(time);
        Ok(())
    }

    async fn insert_time_series(&self, source_id: i64, ensemble_id: i64) -> TsResult<i64> {
        let mut state = self.state()?;
        if !state.sources.contains_key(&source_id) {
            return Err(TsError::SourceNotFound(source_id));
        }

        let existing = state
            .time_series
            .iter()
            .find(|(_, key)| **key == (source_id, ensemble_id))
            .map(|(id, _)| *id);
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = state.next_id();
        state.time_series.insert(id, (source_id, ensemble_id));
        Ok(id)
    }

    async fn insert_values(&self, rows: &[ValueRow]) -> TsResult<u64> {
        let mut state = self.state()?;

        if let Some(row) = rows
            .iter()
            .find(|r| !state.time_series.contains_key(&r.time_series_id))
        {
            return Err(TsError::DatabaseError(format!(
                "time series {} does not exist",
                row.time_series_id
            )));
        }

        let mut written = 0;
        for row in rows {
            let key = (row.time_series_id, row.lead_minutes);
            if !state.values.contains_key(&key) {
                state.values.insert(key, row.value);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn mark_complete(&self, source_id: i64) -> TsResult<bool> {
        let mut state = self.state()?;
        if !state.sources.contains_key(&source_id) {
            return Err(TsError::SourceNotFound(source_id));
        }
        Ok(state.completed.insert(source_id))
    }

    async fn was_completed(&self, source_id: i64) -> TsResult<bool> {
        Ok(self.state()?.completed.contains(&source_id))
    }

    async fn remove_source(&self, source_id: i64) -> TsResult<bool> {
        let mut state = self.state()?;
        if state.completed.contains(&source_id) {
            return Ok(false);
        }
        let Some(stored) = state.sources.remove(&source_id) else {
            return Ok(false);
        };

        state.by_hash.remove(&stored.record.hash);
        state.reference_times.retain(|(source, _), _| *source != source_id);

        let series: HashSet<i64> = state
            .time_series
            .iter()
            .filter(|(_, (source, _))| *source == source_id)
            .map(|(id, _)| *id)
            .collect();
        state.time_series.retain(|id, _| !series.contains(id));
        state.values.retain(|(id, _), _| !series.contains(id));

        Ok(true)
    }

    async fn incomplete_sources(&self) -> TsResult<Vec<SourceRow>> {
        let state = self.state()?;
        Ok(state
            .sources
            .iter()
            .filter(|(id, _)| !state.completed.contains(*id))
            .map(|(id, stored)| state.row(*id, stored))
            .collect())
    }
}

#[async_trait]
impl ReferenceKeys for MemoryCatalog {
    async fn feature_id(&self, feature: &Feature) -> TsResult<i64> {
        Ok(self.state()?.key(format!("feature:{}", feature)))
    }

    async fn measurement_unit_id(&self, unit: &str) -> TsResult<i64> {
        Ok(self.state()?.key(format!("unit:{}", unit)))
    }

    async fn time_scale_id(&self, time_scale: &TimeScale) -> TsResult<i64> {
        Ok(self.state()?.key(format!("scale:{}", time_scale)))
    }

    async fn ensemble_id(&self, name: &str) -> TsResult<i64> {
        Ok(self.state()?.key(format!("ensemble:{}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str) -> SourceRecord {
        SourceRecord {
            hash: hash.to_string(),
            path: "/data/a.csv".to_string(),
            variable_name: "streamflow".to_string(),
            measurement_unit_id: None,
            feature_id: None,
            time_scale_id: None,
            lead_minutes: None,
            is_point_data: true,
        }
    }

    #[tokio::test]
    async fn test_register_is_insert_or_get() {
        let catalog = MemoryCatalog::new();
        let first = catalog.register_source(&record("AB")).await.unwrap();
        let second = catalog.register_source(&record("AB")).await.unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.source_id, second.source_id);
        assert_eq!(catalog.source_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_values_ignore_duplicate_leads() {
        let catalog = MemoryCatalog::new();
        let source = catalog.register_source(&record("AB")).await.unwrap();
        let series = catalog.insert_time_series(source.source_id, 1).await.unwrap();

        let rows = [
            ValueRow { time_series_id: series, lead_minutes: 60, value: Some(1.0) },
            ValueRow { time_series_id: series, lead_minutes: 60, value: Some(2.0) },
            ValueRow { time_series_id: series, lead_minutes: 120, value: None },
        ];
        assert_eq!(catalog.insert_values(&rows).await.unwrap(), 2);
        assert_eq!(
            catalog.values_for(series).unwrap(),
            vec![(60, Some(1.0)), (120, None)]
        );
    }

    #[tokio::test]
    async fn test_remove_cascades_and_spares_completed() {
        let catalog = MemoryCatalog::new();
        let open = catalog.register_source(&record("OPEN")).await.unwrap().source_id;
        let done = catalog.register_source(&record("DONE")).await.unwrap().source_id;
        let series = catalog.insert_time_series(open, 1).await.unwrap();
        catalog
            .insert_values(&[ValueRow { time_series_id: series, lead_minutes: 0, value: None }])
            .await
            .unwrap();
        catalog.mark_complete(done).await.unwrap();

        assert!(catalog.remove_source(open).await.unwrap());
        assert!(!catalog.remove_source(done).await.unwrap());
        assert_eq!(catalog.value_count().unwrap(), 0);
        assert!(catalog.find_source("OPEN").await.unwrap().is_none());
        assert!(catalog.find_source("DONE").await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn test_mark_complete_written_once() {
        let catalog = MemoryCatalog::new();
        let id = catalog.register_source(&record("AB")).await.unwrap().source_id;
        assert!(catalog.mark_complete(id).await.unwrap());
        assert!(!catalog.mark_complete(id).await.unwrap());
        assert!(catalog.incomplete_sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reference_keys_are_stable() {
        let catalog = MemoryCatalog::new();
        let a = catalog.ensemble_id("123").await.unwrap();
        let b = catalog.ensemble_id("456").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(catalog.ensemble_id("123").await.unwrap(), a);
    }
}
