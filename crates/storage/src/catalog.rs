//! Source catalog using PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::QueryScalar;
use sqlx::{FromRow, PgPool, Postgres};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, instrument};

use ts_common::{Feature, ReferenceTimeType, TimeScale, TsError, TsResult};

use crate::store::{
    ReferenceKeys, RegisteredSource, SourceRecord, SourceRow, SourceStore, ValueRow,
};

/// Attempts at re-reading a row that a concurrent writer has committed but
/// the current statement snapshot cannot yet see.
const READ_BACK_ATTEMPTS: u32 = 10;
const READ_BACK_DELAY: Duration = Duration::from_millis(5);

/// Pause before re-reading a row a concurrent transaction has not yet
/// committed; grows linearly with the attempt.
fn read_back_delay(attempt: u32) -> Duration {
    READ_BACK_DELAY * (attempt + 1)
}

/// Database connection pool and catalog operations.
pub struct Catalog {
    pool: PgPool,
    /// Reference keys never change once assigned
    keys: RwLock<HashMap<String, i64>>,
}

impl Catalog {
    /// Create a new catalog connection from database URL.
    pub async fn connect(database_url: &str, max_connections: u32) -> TsResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| TsError::ServiceUnavailable(format!("Connection failed: {}", e)))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> TsResult<()> {
        // Split SQL statements and execute them individually
        for statement in SCHEMA_SQL.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| TsError::DatabaseError(format!("Migration failed: {}", e)))?;
            }
        }

        Ok(())
    }

    fn cached_key(&self, cache_key: &str) -> Option<i64> {
        self.keys
            .read()
            .ok()
            .and_then(|keys| keys.get(cache_key).copied())
    }

    fn remember_key(&self, cache_key: String, id: i64) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(cache_key, id);
        }
    }

    /// Run a get-or-create statement, re-reading while a concurrent insert
    /// is not yet visible.
    async fn get_or_create_key<'q, F>(&self, cache_key: String, build: F) -> TsResult<i64>
    where
        F: Fn() -> QueryScalar<'q, Postgres, i64, PgArguments>,
    {
        if let Some(id) = self.cached_key(&cache_key) {
            return Ok(id);
        }

        for attempt in 0..READ_BACK_ATTEMPTS {
            let id = build()
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| TsError::DatabaseError(format!("Key lookup failed: {}", e)))?;

            if let Some(id) = id {
                self.remember_key(cache_key, id);
                return Ok(id);
            }

            debug!(key = %cache_key, attempt, "Reference key not yet visible, re-reading");
            tokio::time::sleep(read_back_delay(attempt)).await;
        }

        Err(TsError::DatabaseError(format!(
            "Reference key {} neither inserted nor found",
            cache_key
        )))
    }
}

#[async_trait]
impl SourceStore for Catalog {
    #[instrument(skip(self, record), fields(hash = %record.hash))]
    async fn register_source(&self, record: &SourceRecord) -> TsResult<RegisteredSource> {
        for attempt in 0..READ_BACK_ATTEMPTS {
            let row: Option<(i64, bool)> = sqlx::query_as(
                r#"
                WITH inserted AS (
                    INSERT INTO sources (
                        hash, path, variable_name,
                        measurementunit_id, feature_id, timescale_id,
                        lead, is_point_data
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (hash) DO NOTHING
                    RETURNING id
                )
                SELECT id, TRUE AS inserted FROM inserted
                UNION ALL
                SELECT id, FALSE AS inserted FROM sources WHERE hash = $1
                LIMIT 1
                "#,
            )
            .bind(&record.hash)
            .bind(&record.path)
            .bind(&record.variable_name)
            .bind(record.measurement_unit_id)
            .bind(record.feature_id)
            .bind(record.time_scale_id)
            .bind(record.lead_minutes)
            .bind(record.is_point_data)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TsError::DatabaseError(format!("Source registration failed: {}", e)))?;

            if let Some((source_id, inserted)) = row {
                return Ok(RegisteredSource {
                    source_id,
                    inserted,
                });
            }

            debug!(attempt, "Concurrently registered source not yet visible, re-reading");
            tokio::time::sleep(read_back_delay(attempt)).await;
        }

        Err(TsError::DatabaseError(format!(
            "Source {} neither inserted nor found",
            record.hash
        )))
    }

    async fn find_source(&self, hash: &str) -> TsResult<Option<SourceRow>> {
        let row = sqlx::query_as::<_, SourceDbRow>(
            "SELECT s.id, s.hash, s.path, s.registered_at, \
             (c.source_id IS NOT NULL) AS completed \
             FROM sources s LEFT JOIN source_completions c ON c.source_id = s.id \
             WHERE s.hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TsError::DatabaseError(format!("Query failed: {}", e)))?;

        Ok(row.map(Into::into))
    }

    async fn insert_reference_time(
        &self,
        source_id: i64,
        kind: ReferenceTimeType,
        time: DateTime<Utc>,
    ) -> TsResult<()> {
        sqlx::query(
            "INSERT INTO source_reference_times (source_id, reference_time, reference_time_type) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (source_id, reference_time_type) DO NOTHING",
        )
        .bind(source_id)
        .bind(time)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| TsError::DatabaseError(format!("Reference time insert failed: {}", e)))?;

        Ok(())
    }

    async fn insert_time_series(&self, source_id: i64, ensemble_id: i64) -> TsResult<i64> {
        sqlx::query_scalar(
            "INSERT INTO timeseries (source_id, ensemble_id) VALUES ($1, $2) \
             ON CONFLICT (source_id, ensemble_id) DO UPDATE SET ensemble_id = EXCLUDED.ensemble_id \
             RETURNING id",
        )
        .bind(source_id)
        .bind(ensemble_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TsError::DatabaseError(format!("Time series insert failed: {}", e)))
    }

    async fn insert_values(&self, rows: &[ValueRow]) -> TsResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let series: Vec<i64> = rows.iter().map(|r| r.time_series_id).collect();
        let leads: Vec<i32> = rows.iter().map(|r| r.lead_minutes).collect();
        let values: Vec<Option<f64>> = rows.iter().map(|r| r.value).collect();

        let result = sqlx::query(
            "INSERT INTO timeseries_values (timeseries_id, lead, series_value) \
             SELECT * FROM UNNEST($1::BIGINT[], $2::INTEGER[], $3::DOUBLE PRECISION[]) \
             ON CONFLICT (timeseries_id, lead) DO NOTHING",
        )
        .bind(series)
        .bind(leads)
        .bind(values)
        .execute(&self.pool)
        .await
        .map_err(|e| TsError::DatabaseError(format!("Value insert failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn mark_complete(&self, source_id: i64) -> TsResult<bool> {
        let result = sqlx::query(
            "INSERT INTO source_completions (source_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(source_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TsError::DatabaseError(format!("Completion insert failed: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn was_completed(&self, source_id: i64) -> TsResult<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM source_completions WHERE source_id = $1)",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TsError::DatabaseError(format!("Query failed: {}", e)))
    }

    async fn remove_source(&self, source_id: i64) -> TsResult<bool> {
        let result = sqlx::query(
            "DELETE FROM sources WHERE id = $1 \
             AND NOT EXISTS (SELECT 1 FROM source_completions WHERE source_id = $1)",
        )
        .bind(source_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TsError::DatabaseError(format!("Delete failed: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn incomplete_sources(&self) -> TsResult<Vec<SourceRow>> {
        let rows = sqlx::query_as::<_, SourceDbRow>(
            "SELECT s.id, s.hash, s.path, s.registered_at, FALSE AS completed \
             FROM sources s LEFT JOIN source_completions c ON c.source_id = s.id \
             WHERE c.source_id IS NULL ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TsError::DatabaseError(format!("Query failed: {}", e)))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl ReferenceKeys for Catalog {
    async fn feature_id(&self, feature: &Feature) -> TsResult<i64> {
        let natural_key = feature.to_string();
        self.get_or_create_key(format!("feature:{}", natural_key), || {
            sqlx::query_scalar(
                r#"
                WITH inserted AS (
                    INSERT INTO features (feature_key, name, description, srid, wkt)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (feature_key) DO NOTHING
                    RETURNING id
                )
                SELECT id FROM inserted
                UNION ALL
                SELECT id FROM features WHERE feature_key = $1
                LIMIT 1
                "#,
            )
            .bind(natural_key.clone())
            .bind(feature.name.clone())
            .bind(feature.description.clone())
            .bind(feature.srid)
            .bind(feature.wkt.clone())
        })
        .await
    }

    async fn measurement_unit_id(&self, unit: &str) -> TsResult<i64> {
        let unit = unit.to_string();
        self.get_or_create_key(format!("unit:{}", unit), || {
            sqlx::query_scalar(
                r#"
                WITH inserted AS (
                    INSERT INTO measurement_units (unit_name) VALUES ($1)
                    ON CONFLICT (unit_name) DO NOTHING
                    RETURNING id
                )
                SELECT id FROM inserted
                UNION ALL
                SELECT id FROM measurement_units WHERE unit_name = $1
                LIMIT 1
                "#,
            )
            .bind(unit.clone())
        })
        .await
    }

    async fn time_scale_id(&self, time_scale: &TimeScale) -> TsResult<i64> {
        let function = time_scale.function.as_str();
        self.get_or_create_key(format!("scale:{}", time_scale), || {
            sqlx::query_scalar(
                r#"
                WITH inserted AS (
                    INSERT INTO time_scales (duration_minutes, function_name) VALUES ($1, $2)
                    ON CONFLICT (duration_minutes, function_name) DO NOTHING
                    RETURNING id
                )
                SELECT id FROM inserted
                UNION ALL
                SELECT id FROM time_scales WHERE duration_minutes = $1 AND function_name = $2
                LIMIT 1
                "#,
            )
            .bind(time_scale.period_minutes)
            .bind(function)
        })
        .await
    }

    async fn ensemble_id(&self, name: &str) -> TsResult<i64> {
        let name = name.to_string();
        self.get_or_create_key(format!("ensemble:{}", name), || {
            sqlx::query_scalar(
                r#"
                WITH inserted AS (
                    INSERT INTO ensembles (ensemble_name) VALUES ($1)
                    ON CONFLICT (ensemble_name) DO NOTHING
                    RETURNING id
                )
                SELECT id FROM inserted
                UNION ALL
                SELECT id FROM ensembles WHERE ensemble_name = $1
                LIMIT 1
                "#,
            )
            .bind(name.clone())
        })
        .await
    }
}

/// Internal row type for database queries.
#[derive(FromRow)]
struct SourceDbRow {
    id: i64,
    hash: String,
    path: String,
    registered_at: DateTime<Utc>,
    completed: bool,
}

impl From<SourceDbRow> for SourceRow {
    fn from(row: SourceDbRow) -> Self {
        SourceRow {
            source_id: row.id,
            hash: row.hash,
            path: row.path,
            registered_at: row.registered_at,
            completed: row.completed,
        }
    }
}

/// Database schema SQL.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS measurement_units (
    id BIGSERIAL PRIMARY KEY,
    unit_name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS features (
    id BIGSERIAL PRIMARY KEY,
    feature_key TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT,
    srid INTEGER,
    wkt TEXT
);

CREATE TABLE IF NOT EXISTS time_scales (
    id BIGSERIAL PRIMARY KEY,
    duration_minutes BIGINT NOT NULL,
    function_name VARCHAR(20) NOT NULL,

    UNIQUE(duration_minutes, function_name)
);

CREATE TABLE IF NOT EXISTS ensembles (
    id BIGSERIAL PRIMARY KEY,
    ensemble_name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS sources (
    id BIGSERIAL PRIMARY KEY,
    hash VARCHAR(32) NOT NULL UNIQUE,
    path TEXT NOT NULL,
    variable_name TEXT NOT NULL,
    measurementunit_id BIGINT REFERENCES measurement_units(id),
    feature_id BIGINT REFERENCES features(id),
    timescale_id BIGINT REFERENCES time_scales(id),
    lead INTEGER,
    is_point_data BOOLEAN NOT NULL,
    registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS source_reference_times (
    source_id BIGINT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    reference_time TIMESTAMPTZ NOT NULL,
    reference_time_type VARCHAR(30) NOT NULL,

    PRIMARY KEY (source_id, reference_time_type)
);

CREATE TABLE IF NOT EXISTS timeseries (
    id BIGSERIAL PRIMARY KEY,
    source_id BIGINT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    ensemble_id BIGINT NOT NULL REFERENCES ensembles(id),

    UNIQUE(source_id, ensemble_id)
);

CREATE TABLE IF NOT EXISTS timeseries_values (
    timeseries_id BIGINT NOT NULL REFERENCES timeseries(id) ON DELETE CASCADE,
    lead INTEGER NOT NULL,
    series_value DOUBLE PRECISION,

    PRIMARY KEY (timeseries_id, lead)
);

CREATE TABLE IF NOT EXISTS source_completions (
    source_id BIGINT PRIMARY KEY REFERENCES sources(id) ON DELETE CASCADE,
    completed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_timeseries_source ON timeseries(source_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_back_waits_longer_each_attempt() {
        assert_eq!(read_back_delay(0), Duration::from_millis(5));
        assert!(read_back_delay(1) > read_back_delay(0));

        let total: Duration = (0..READ_BACK_ATTEMPTS).map(read_back_delay).sum();
        assert!(total >= Duration::from_millis(250));
    }
}
