//! Fan-out writer for value rows.
//!
//! Writes are buffered and issued in batches on background tasks; callers get
//! a [`LatchPair`] per row instead of waiting. At most
//! `max_concurrent_copies` batches are in flight at once.
//!
//! A batch never mixes sources: each source writes through its own writer
//! from [`EventWriter::for_source`], sharing only the copy permits.

use std::mem;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use storage::{SourceStore, ValueRow};

use crate::error::{IngestionError, Result};
use crate::latch::{latch_pair, LatchPair, LatchPairTrigger};

struct PendingRow {
    row: ValueRow,
    trigger: LatchPairTrigger,
}

/// Batches value rows into bulk inserts.
pub struct EventWriter {
    store: Arc<dyn SourceStore>,
    batch_size: usize,
    pending: Mutex<Vec<PendingRow>>,
    permits: Arc<Semaphore>,
}

impl EventWriter {
    pub fn new(store: Arc<dyn SourceStore>, batch_size: usize, max_concurrent_copies: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            pending: Mutex::new(Vec::with_capacity(batch_size.max(1))),
            permits: Arc::new(Semaphore::new(max_concurrent_copies.max(1))),
        }
    }

    /// A writer with an empty buffer that shares this writer's store and
    /// copy permits.
    pub fn for_source(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            batch_size: self.batch_size,
            pending: Mutex::new(Vec::with_capacity(self.batch_size)),
            permits: Arc::clone(&self.permits),
        }
    }

    /// Queue one value row. A full batch is dispatched immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn write(&self, time_series_id: i64, lead_minutes: i32, value: Option<f64>) -> Result<LatchPair> {
        let (trigger, pair) = latch_pair();
        let row = ValueRow {
            time_series_id,
            lead_minutes,
            value,
        };

        let full = {
            let mut pending = self.pending()?;
            pending.push(PendingRow { row, trigger });
            if pending.len() >= self.batch_size {
                Some(mem::take(&mut *pending))
            } else {
                None
            }
        };

        if let Some(batch) = full {
            self.dispatch(batch);
        }

        Ok(pair)
    }

    /// Dispatch any partially filled batch.
    pub fn flush(&self) -> Result<()> {
        let batch = mem::take(&mut *self.pending()?);
        if !batch.is_empty() {
            self.dispatch(batch);
        }
        Ok(())
    }

    fn pending(&self) -> Result<std::sync::MutexGuard<'_, Vec<PendingRow>>> {
        self.pending
            .lock()
            .map_err(|_| IngestionError::Latch("writer buffer lock poisoned".to_string()))
    }

    fn dispatch(&self, batch: Vec<PendingRow>) {
        let store = Arc::clone(&self.store);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    for pending in &batch {
                        pending.trigger.fail("writer shut down");
                    }
                    return;
                }
            };

            for pending in &batch {
                pending.trigger.dispatched.release();
            }

            let rows: Vec<ValueRow> = batch.iter().map(|p| p.row).collect();
            match store.insert_values(&rows).await {
                Ok(written) => {
                    debug!(rows = rows.len(), written, "Value batch written");
                    for pending in &batch {
                        pending.trigger.completed.release();
                    }
                }
                Err(e) => {
                    warn!(rows = rows.len(), error = %e, "Value batch failed");
                    let message = e.to_string();
                    for pending in &batch {
                        pending.trigger.completed.fail(&message);
                    }
                }
            }
        });
    }
}
