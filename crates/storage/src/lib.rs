//! Storage abstractions for the time-series ingest services.
//!
//! Provides unified interfaces for:
//! - PostgreSQL for the source catalog and value rows
//! - Session-level advisory locks for ingest exclusion
//! - In-memory equivalents for single-process runs

pub mod catalog;
pub mod lock;
pub mod memory;
pub mod store;

pub use catalog::Catalog;
pub use lock::{lock_name, MemoryLockManager, PgLockManager, SourceLockManager, INGEST_SOURCE_PREFIX};
pub use memory::MemoryCatalog;
pub use store::{
    ReferenceKeys, RegisteredSource, SourceRecord, SourceRow, SourceStore, ValueRow,
    DEFAULT_ENSEMBLE_NAME,
};
