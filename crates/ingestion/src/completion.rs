//! Completion markers: a source is complete only once every value row
//! written for it has been confirmed by the store.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use storage::{SourceLockManager, SourceStore};

use crate::error::Result;
use crate::latch::{await_completed, LatchPair};
use crate::writer::EventWriter;

/// Writes completion markers and answers whether a source was completed.
pub struct CompletionTracker {
    store: Arc<dyn SourceStore>,
    locks: Arc<dyn SourceLockManager>,
}

impl CompletionTracker {
    pub fn new(store: Arc<dyn SourceStore>, locks: Arc<dyn SourceLockManager>) -> Self {
        Self { store, locks }
    }

    /// Side-effect free; never waits on in-flight writes.
    pub async fn was_completed(&self, source_id: i64) -> Result<bool> {
        Ok(self.store.was_completed(source_id).await?)
    }

    /// Flush the source's writer, wait for every write of the source, write
    /// its marker, then release its lock. A failed write aborts before the
    /// marker is written and leaves the lock to the caller.
    #[instrument(skip(self, writer, latches), fields(writes = latches.len()))]
    pub async fn mark_complete(
        &self,
        source_id: i64,
        writer: &EventWriter,
        latches: &[LatchPair],
    ) -> Result<()> {
        if latches.iter().any(|pair| !pair.dispatched.is_settled()) {
            writer.flush()?;
        }

        await_completed(latches).await?;

        if self.store.mark_complete(source_id).await? {
            debug!(source_id, "Marked source complete");
        } else {
            warn!(source_id, "Source was already marked complete");
        }

        self.locks.unlock_source(source_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use storage::{
        MemoryCatalog, MemoryLockManager, RegisteredSource, SourceRecord, SourceRow, ValueRow,
    };
    use tokio::sync::Semaphore;
    use ts_common::{ReferenceTimeType, TsResult};

    /// Holds every value insert until a permit is added.
    struct GatedStore {
        inner: MemoryCatalog,
        gate: Semaphore,
    }

    #[async_trait]
    impl SourceStore for GatedStore {
        async fn register_source(&self, record: &SourceRecord) -> TsResult<RegisteredSource> {
            self.inner.register_source(record).await
        }
        async fn find_source(&self, hash: &str) -> TsResult<Option<SourceRow>> {
            self.inner.find_source(hash).await
        }
        async fn insert_reference_time(
            &self,
            source_id: i64,
            kind: ReferenceTimeType,
            time: DateTime<Utc>,
        ) -> TsResult<()> {
            self.inner.insert_reference_time(source_id, kind, time).await
        }
        async fn insert_time_series(&self, source_id: i64, ensemble_id: i64) -> TsResult<i64> {
            self.inner.insert_time_series(source_id, ensemble_id).await
        }
        async fn insert_values(&self, rows: &[ValueRow]) -> TsResult<u64> {
            let _permit = self.gate.acquire().await.expect("gate open");
            self.inner.insert_values(rows).await
        }
        async fn mark_complete(&self, source_id: i64) -> TsResult<bool> {
            self.inner.mark_complete(source_id).await
        }
        async fn was_completed(&self, source_id: i64) -> TsResult<bool> {
            self.inner.was_completed(source_id).await
        }
        async fn remove_source(&self, source_id: i64) -> TsResult<bool> {
            self.inner.remove_source(source_id).await
        }
        async fn incomplete_sources(&self) -> TsResult<Vec<SourceRow>> {
            self.inner.incomplete_sources().await
        }
    }

    fn record() -> SourceRecord {
        SourceRecord {
            hash: "CD".to_string(),
            path: "b.csv".to_string(),
            variable_name: "stage".to_string(),
            measurement_unit_id: None,
            feature_id: None,
            time_scale_id: None,
            lead_minutes: None,
            is_point_data: true,
        }
    }

    #[tokio::test]
    async fn test_marker_waits_for_every_write() {
        let store = Arc::new(GatedStore {
            inner: MemoryCatalog::new(),
            gate: Semaphore::new(0),
        });
        let locks = Arc::new(MemoryLockManager::default());
        let writer = Arc::new(EventWriter::new(store.clone(), 2, 2));
        let tracker = Arc::new(CompletionTracker::new(store.clone(), locks.clone()));

        let source = store.register_source(&record()).await.unwrap().source_id;
        assert!(locks.try_lock_source(source).await.unwrap());
        let series = store.insert_time_series(source, 1).await.unwrap();
        let latches: Vec<LatchPair> = (0..3)
            .map(|i| writer.write(series, i * 60, Some(1.0)).unwrap())
            .collect();

        let completing = {
            let tracker = Arc::clone(&tracker);
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { tracker.mark_complete(source, &writer, &latches).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!tracker.was_completed(source).await.unwrap());
        assert!(locks.is_source_locked(source).await.unwrap());

        store.gate.add_permits(10);
        completing.await.unwrap().unwrap();

        assert!(tracker.was_completed(source).await.unwrap());
        assert!(!locks.is_source_locked(source).await.unwrap());
        assert_eq!(store.inner.value_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_source_incomplete_and_locked() {
        let store = Arc::new(MemoryCatalog::new());
        let locks = Arc::new(MemoryLockManager::default());
        let writer = EventWriter::new(store.clone(), 10, 1);
        let tracker = CompletionTracker::new(store.clone(), locks.clone());

        let source = store.register_source(&record()).await.unwrap().source_id;
        locks.lock_source(source).await.unwrap();
        let latches = vec![writer.write(12345, 0, None).unwrap()];

        assert!(tracker.mark_complete(source, &writer, &latches).await.is_err());
        assert!(!tracker.was_completed(source).await.unwrap());
        assert!(locks.is_source_locked(source).await.unwrap());
    }
}
