//! Reader interfaces: turning a source into a stream of time series.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;

use ts_common::{DataDisposition, DataSource, TimeSeriesTuple};

use crate::error::{IngestionError, Result};

/// A finite, non-restartable stream of series read from one source.
pub type TimeSeriesStream = BoxStream<'static, Result<TimeSeriesTuple>>;

/// Reads the time series held by a source of one format.
pub trait TimeSeriesReader: Send + Sync {
    fn read(&self, source: &DataSource) -> Result<TimeSeriesStream>;
}

/// Readers keyed by the disposition they understand.
#[derive(Default, Clone)]
pub struct ReaderRegistry {
    readers: HashMap<DataDisposition, Arc<dyn TimeSeriesReader>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, disposition: DataDisposition, reader: Arc<dyn TimeSeriesReader>) {
        self.readers.insert(disposition, reader);
    }

    pub fn with_reader(mut self, disposition: DataDisposition, reader: Arc<dyn TimeSeriesReader>) -> Self {
        self.register(disposition, reader);
        self
    }

    pub fn get(&self, disposition: DataDisposition) -> Result<Arc<dyn TimeSeriesReader>> {
        self.readers
            .get(&disposition)
            .cloned()
            .ok_or(IngestionError::NoReader(disposition))
    }

    pub fn supports(&self, disposition: DataDisposition) -> bool {
        self.readers.contains_key(&disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use test_utils::{data_source, hourly_forecast};

    struct FixedReader;

    impl TimeSeriesReader for FixedReader {
        fn read(&self, source: &DataSource) -> Result<TimeSeriesStream> {
            let tuple = TimeSeriesTuple::new(hourly_forecast(2), source.clone());
            Ok(stream::iter(vec![Ok(tuple)]).boxed())
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_disposition() {
        let registry = ReaderRegistry::new().with_reader(DataDisposition::CsvWres, Arc::new(FixedReader));
        let source = data_source("a.csv", DataDisposition::CsvWres);

        let reader = registry.get(DataDisposition::CsvWres).unwrap();
        let tuples: Vec<_> = reader.read(&source).unwrap().collect().await;
        assert_eq!(tuples.len(), 1);
        assert!(registry.supports(DataDisposition::CsvWres));
    }

    #[test]
    fn test_missing_reader_is_an_error() {
        let registry = ReaderRegistry::new();
        assert!(matches!(
            registry.get(DataDisposition::Datacard),
            Err(IngestionError::NoReader(DataDisposition::Datacard))
        ));
    }
}
