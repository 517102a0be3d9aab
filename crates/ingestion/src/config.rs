//! Tuning for the ingest engine.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestionError, Result};

/// Concurrency, batching and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Series ingested concurrently within one source
    pub max_ingest_threads: usize,

    /// Source pipelines (read, normalise, ingest) running concurrently
    pub max_concurrent_sources: usize,

    /// Value rows per bulk insert
    pub value_batch_size: usize,

    /// Bulk inserts in flight at once
    pub max_concurrent_copies: usize,

    /// Re-attempts of a series whose source another task is ingesting
    pub max_retries: u32,

    /// First back-off delay; doubles on every retry
    pub retry_backoff_ms: u64,

    /// How often a blocked lock waiter re-polls
    pub lock_poll_interval_ms: u64,

    /// Age after which an unlocked, incomplete source counts as abandoned
    pub abandoned_grace_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_ingest_threads: 6,
            max_concurrent_sources: 4,
            value_batch_size: 1000,
            max_concurrent_copies: 4,
            max_retries: 10,
            retry_backoff_ms: 1000,
            lock_poll_interval_ms: 100,
            abandoned_grace_secs: 60,
        }
    }
}

impl IngestConfig {
    /// Load from `INGEST_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_ingest_threads: env_or("INGEST_MAX_THREADS", defaults.max_ingest_threads)?,
            max_concurrent_sources: env_or(
                "INGEST_MAX_CONCURRENT_SOURCES",
                defaults.max_concurrent_sources,
            )?,
            value_batch_size: env_or("INGEST_VALUE_BATCH_SIZE", defaults.value_batch_size)?,
            max_concurrent_copies: env_or(
                "INGEST_MAX_CONCURRENT_COPIES",
                defaults.max_concurrent_copies,
            )?,
            max_retries: env_or("INGEST_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_ms: env_or("INGEST_RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
            lock_poll_interval_ms: env_or(
                "INGEST_LOCK_POLL_INTERVAL_MS",
                defaults.lock_poll_interval_ms,
            )?,
            abandoned_grace_secs: env_or(
                "INGEST_ABANDONED_GRACE_SECS",
                defaults.abandoned_grace_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_ingest_threads", self.max_ingest_threads),
            ("max_concurrent_sources", self.max_concurrent_sources),
            ("value_batch_size", self.value_batch_size),
            ("max_concurrent_copies", self.max_concurrent_copies),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(IngestionError::InvalidConfig(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn abandoned_grace(&self) -> chrono::Duration {
        // chrono caps durations at i64::MAX milliseconds
        let secs = i64::try_from(self.abandoned_grace_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1_000);
        chrono::Duration::seconds(secs)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            IngestionError::InvalidConfig(format!("{} has unparseable value '{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(IngestConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = IngestConfig {
            value_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(IngestionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let config = IngestConfig::default();
        assert_eq!(config.retry_backoff(0), Duration::from_secs(1));
        assert_eq!(config.retry_backoff(1), Duration::from_secs(2));
        assert_eq!(config.retry_backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_retry_backoff_saturates() {
        let config = IngestConfig::default();
        assert_eq!(config.retry_backoff(80), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: IngestConfig =
            serde_yaml::from_str("max_retries: 2\nvalue_batch_size: 50\n").unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.value_batch_size, 50);
        assert_eq!(config.max_ingest_threads, 6);
    }
}
