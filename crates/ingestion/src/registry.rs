//! Source registration by natural key.

use std::sync::Arc;

use tracing::debug;

use storage::{ReferenceKeys, RegisteredSource, SourceRecord, SourceRow, SourceStore};
use ts_common::{DataSource, TimeSeriesMetadata, TsError};

use crate::error::{IngestionError, Result};

/// Insert-or-get registration of sources, resolving reference keys first.
///
/// Every store failure here happens before anything is written for the
/// source and is reported as a pre-ingest error.
pub struct SourceRegistry {
    store: Arc<dyn SourceStore>,
    keys: Arc<dyn ReferenceKeys>,
}

impl SourceRegistry {
    pub fn new(store: Arc<dyn SourceStore>, keys: Arc<dyn ReferenceKeys>) -> Self {
        Self { store, keys }
    }

    /// Register a point time series read from `uri`.
    pub async fn register_series(
        &self,
        hash: &str,
        metadata: &TimeSeriesMetadata,
        uri: &str,
    ) -> Result<RegisteredSource> {
        let pre_ingest = |e: TsError| IngestionError::pre_ingest(uri, e);

        let feature_id = self.keys.feature_id(&metadata.feature).await.map_err(pre_ingest)?;
        let unit_id = self
            .keys
            .measurement_unit_id(&metadata.unit)
            .await
            .map_err(pre_ingest)?;
        let time_scale_id = match &metadata.time_scale {
            Some(scale) => Some(self.keys.time_scale_id(scale).await.map_err(pre_ingest)?),
            None => None,
        };

        let record = SourceRecord {
            hash: hash.to_string(),
            path: uri.to_string(),
            variable_name: metadata.variable_name.clone(),
            measurement_unit_id: Some(unit_id),
            feature_id: Some(feature_id),
            time_scale_id,
            lead_minutes: None,
            is_point_data: true,
        };

        self.register(&record).await
    }

    /// Register a gridded source by reference. Its contents stay in the file.
    pub async fn register_gridded(
        &self,
        hash: &str,
        source: &DataSource,
        lead_minutes: Option<i32>,
    ) -> Result<RegisteredSource> {
        let record = SourceRecord {
            hash: hash.to_string(),
            path: source.uri().to_string(),
            variable_name: source.declared().variable.clone().unwrap_or_default(),
            measurement_unit_id: None,
            feature_id: None,
            time_scale_id: None,
            lead_minutes,
            is_point_data: false,
        };

        self.register(&record).await
    }

    pub async fn find(&self, hash: &str) -> Result<Option<SourceRow>> {
        Ok(self.store.find_source(hash).await?)
    }

    async fn register(&self, record: &SourceRecord) -> Result<RegisteredSource> {
        let registered = self
            .store
            .register_source(record)
            .await
            .map_err(|e| IngestionError::pre_ingest(&record.path, e))?;

        debug!(
            hash = %record.hash,
            source_id = registered.source_id,
            inserted = registered.inserted,
            "Registered source"
        );
        Ok(registered)
    }
}
