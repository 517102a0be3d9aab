//! Time-series ingest library.
//!
//! Provides the core logic for ingesting time series into a relational store
//! with content-based deduplication.
//!
//! # Architecture
//!
//! The crate is used by the `ingester` service and by embedding applications
//! that bring their own readers. It handles:
//!
//! - Content identification (MD5 over a canonical serialization)
//! - Insert-or-get source registration and advisory locking
//! - Batched fan-out of value writes with completion latches
//! - Completion markers and abandoned-source recovery
//! - Expanding declarations into concrete sources (directories, globs,
//!   gzip and tar archives) and scheduling them

pub mod archive;
pub mod completion;
pub mod config;
pub mod disposition;
pub mod error;
pub mod identifier;
pub mod ingester;
pub mod latch;
pub mod loader;
pub mod missing;
pub mod reader;
pub mod registry;
pub mod result;
pub mod writer;

// Re-exports
pub use completion::CompletionTracker;
pub use config::IngestConfig;
pub use disposition::{detect_disposition, extract_forecast_hour, extract_lead_minutes};
pub use error::{IngestionError, Result};
pub use identifier::{identify, identify_gridded};
pub use ingester::{SourceStatus, TimeSeriesIngester};
pub use latch::{latch_pair, Latch, LatchPair};
pub use loader::{LoadOutcome, LoadStatus, SkippedSource, SourceFailure, SourceLoader};
pub use missing::MissingValueNormalizer;
pub use reader::{ReaderRegistry, TimeSeriesReader, TimeSeriesStream};
pub use registry::SourceRegistry;
pub use result::{IngestResult, OrientationCounts};
pub use writer::EventWriter;
