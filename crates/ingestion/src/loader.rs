//! Source loader: expands a declaration into concrete sources and runs one
//! bounded ingest task per source.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, FuturesUnordered};
use futures::{Future, StreamExt};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use ts_common::{DataDisposition, DataSource, DatasetOrientation, Declaration, DeclaredSource};

use crate::archive::decompose;
use crate::disposition::detect_disposition;
use crate::error::{IngestionError, Result};
use crate::ingester::{SourceStatus, TimeSeriesIngester};
use crate::missing::MissingValueNormalizer;
use crate::reader::{ReaderRegistry, TimeSeriesStream};
use crate::result::IngestResult;

/// What the loader decided about a concrete source before ingesting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    RequiresDecomposition,
    Invalid,
    NotPresent,
    InFlight,
    Abandoned(i64),
    Complete(i64),
}

/// A source that failed; other sources are unaffected.
#[derive(Debug)]
pub struct SourceFailure {
    pub uri: String,
    pub error: IngestionError,
}

/// A source that was never scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSource {
    pub uri: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub results: Vec<IngestResult>,
    pub failures: Vec<SourceFailure>,
    pub skipped: Vec<SkippedSource>,
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Results still waiting on another ingester.
    pub fn needing_retry(&self) -> impl Iterator<Item = &IngestResult> {
        self.results.iter().filter(|r| r.requires_retry())
    }
}

enum SourceOutput {
    Ingested(Vec<IngestResult>),
    Skipped(String),
    Decomposed {
        dir: Arc<TempDir>,
        children: Vec<DataSource>,
    },
}

/// A declared source together with every orientation it was declared in.
struct MergedSource {
    declared: Arc<DeclaredSource>,
    orientation: DatasetOrientation,
    links: Vec<DatasetOrientation>,
}

/// Turns declarations into ingested sources.
#[derive(Clone)]
pub struct SourceLoader {
    ingester: TimeSeriesIngester,
    readers: Arc<ReaderRegistry>,
}

impl SourceLoader {
    pub fn new(ingester: TimeSeriesIngester, readers: ReaderRegistry) -> Self {
        Self {
            ingester,
            readers: Arc::new(readers),
        }
    }

    pub fn ingester(&self) -> &TimeSeriesIngester {
        &self.ingester
    }

    /// Ingest everything a declaration names.
    #[instrument(skip_all)]
    pub async fn load(&self, declaration: &Declaration) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();

        let mut sources = Vec::new();
        for merged in merge_declared(declaration) {
            match self.resolve(&merged).await {
                Ok(resolved) => sources.extend(resolved),
                Err(skipped) => {
                    warn!(uri = %skipped.uri, reason = %skipped.reason, "Skipping declared source");
                    outcome.skipped.push(skipped);
                }
            }
        }

        info!(sources = sources.len(), "Loading sources");

        let permits = Arc::new(Semaphore::new(self.ingester.config().max_concurrent_sources));
        let mut pending = FuturesUnordered::new();
        for source in sources {
            pending.push(self.spawn_source(source, None, Arc::clone(&permits)));
        }

        while let Some((uri, joined)) = pending.next().await {
            match joined {
                Ok(Ok(SourceOutput::Ingested(results))) => outcome.results.extend(results),
                Ok(Ok(SourceOutput::Skipped(reason))) => {
                    warn!(%uri, %reason, "Skipping source");
                    outcome.skipped.push(SkippedSource { uri, reason });
                }
                Ok(Ok(SourceOutput::Decomposed { dir, children })) => {
                    debug!(%uri, children = children.len(), "Scheduling archive members");
                    for child in children {
                        pending.push(self.spawn_source(
                            child,
                            Some(Arc::clone(&dir)),
                            Arc::clone(&permits),
                        ));
                    }
                }
                Ok(Err(error)) => {
                    warn!(%uri, %error, "Source failed");
                    outcome.failures.push(SourceFailure { uri, error });
                }
                Err(e) => {
                    warn!(%uri, error = %e, "Source task aborted");
                    outcome.failures.push(SourceFailure {
                        uri,
                        error: anyhow::anyhow!("source task failed: {}", e).into(),
                    });
                }
            }
        }

        info!(
            results = outcome.results.len(),
            failures = outcome.failures.len(),
            skipped = outcome.skipped.len(),
            "Finished loading sources"
        );
        outcome
    }

    /// Classify a concrete source.
    pub async fn evaluate(&self, source: &DataSource) -> Result<LoadStatus> {
        let disposition = source.disposition();
        if disposition.is_archive() {
            return Ok(LoadStatus::RequiresDecomposition);
        }
        if disposition == DataDisposition::Unknown {
            return Ok(LoadStatus::Invalid);
        }
        if !source.is_gridded() {
            if !self.readers.supports(disposition) {
                return Ok(LoadStatus::Invalid);
            }
            // Point sources are identified per series by the ingester
            return Ok(LoadStatus::NotPresent);
        }

        Ok(match self.ingester.gridded_status(source).await? {
            SourceStatus::NotPresent => LoadStatus::NotPresent,
            SourceStatus::InFlight { .. } => LoadStatus::InFlight,
            SourceStatus::Abandoned { source_id } => LoadStatus::Abandoned(source_id),
            SourceStatus::Complete { source_id } => LoadStatus::Complete(source_id),
        })
    }

    fn spawn_source(
        &self,
        source: DataSource,
        dir: Option<Arc<TempDir>>,
        permits: Arc<Semaphore>,
    ) -> impl Future<Output = (String, std::result::Result<Result<SourceOutput>, JoinError>)> {
        let loader = self.clone();
        let uri = source.uri().to_string();
        let handle = tokio::spawn(async move { loader.run_permitted(source, dir, permits).await });
        async move { (uri, handle.await) }
    }

    async fn run_permitted(
        self,
        source: DataSource,
        dir: Option<Arc<TempDir>>,
        permits: Arc<Semaphore>,
    ) -> Result<SourceOutput> {
        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|e| anyhow::anyhow!("source permits closed: {}", e))?;
        // Holding `dir` keeps an unpacked archive on disk until this member is done
        self.run_source(source, dir.as_deref()).await
    }

    #[instrument(skip_all, fields(uri = %source.uri()))]
    async fn run_source(&self, source: DataSource, dir: Option<&TempDir>) -> Result<SourceOutput> {
        match self.evaluate(&source).await? {
            LoadStatus::Invalid => Ok(SourceOutput::Skipped(format!(
                "no reader for disposition {}",
                source.disposition()
            ))),
            LoadStatus::RequiresDecomposition => {
                let decomposed = decompose(&source).await?;
                let mut children = Vec::with_capacity(decomposed.children.len());
                for path in &decomposed.children {
                    let disposition = detect_disposition(path).await?;
                    children.push(source.child(path.to_string_lossy(), disposition));
                }
                Ok(SourceOutput::Decomposed {
                    dir: decomposed.dir,
                    children,
                })
            }
            LoadStatus::Complete(source_id) => {
                debug!(source_id, "Source already complete");
                if let Some(dir) = dir {
                    remove_decompressed(&source, dir).await;
                }
                Ok(SourceOutput::Ingested(vec![IngestResult::new(
                    &source, source_id, true, false,
                )?]))
            }
            LoadStatus::Abandoned(source_id) => {
                self.ingester.remove_if_abandoned(source_id).await?;
                self.ingest(source).await
            }
            LoadStatus::NotPresent | LoadStatus::InFlight => self.ingest(source).await,
        }
    }

    async fn ingest(&self, source: DataSource) -> Result<SourceOutput> {
        let stream: TimeSeriesStream = if source.is_gridded() {
            stream::empty().boxed()
        } else {
            let reader = self.readers.get(source.disposition())?;
            let normalizer = MissingValueNormalizer::for_source(&source);
            reader
                .read(&source)?
                .map(move |tuple| tuple.map(|t| normalizer.normalize(t)))
                .boxed()
        };

        let results = self.ingester.ingest(stream, &source).await?;
        Ok(SourceOutput::Ingested(results))
    }

    /// Turn a merged declared source into concrete sources.
    async fn resolve(&self, merged: &MergedSource) -> std::result::Result<Vec<DataSource>, SkippedSource> {
        let declared = &merged.declared;
        let skipped = |reason: String| SkippedSource {
            uri: declared.uri.clone(),
            reason,
        };
        let concrete = |uri: String, disposition: DataDisposition| {
            DataSource::new(
                disposition,
                uri,
                merged.orientation,
                merged.links.clone(),
                Arc::clone(declared),
            )
        };

        let lower = declared.uri.to_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return match declared.disposition {
                Some(disposition) => Ok(vec![concrete(declared.uri.clone(), disposition)]),
                None => Err(skipped(
                    "web source declares no disposition".to_string(),
                )),
            };
        }

        let path = PathBuf::from(declared.uri.strip_prefix("file://").unwrap_or(&declared.uri));
        if path.is_dir() {
            let files = walk_matching(&path, declared.pattern.as_deref())
                .await
                .map_err(|e| skipped(e.to_string()))?;
            if files.is_empty() {
                return Err(skipped(format!(
                    "no files match pattern '{}'",
                    declared.pattern.as_deref().unwrap_or("*")
                )));
            }

            let mut sources = Vec::with_capacity(files.len());
            for file in files {
                let disposition = self.disposition_of(&file, declared).await;
                if disposition == DataDisposition::Unknown {
                    warn!(path = %file.display(), "Could not detect disposition, skipping file");
                    continue;
                }
                sources.push(concrete(file.to_string_lossy().into_owned(), disposition));
            }
            return Ok(sources);
        }

        if path.is_file() {
            let disposition = self.disposition_of(&path, declared).await;
            return Ok(vec![concrete(declared.uri.clone(), disposition)]);
        }

        Err(skipped(format!("{} does not exist", path.display())))
    }

    async fn disposition_of(&self, path: &Path, declared: &DeclaredSource) -> DataDisposition {
        match detect_disposition(path).await {
            Ok(DataDisposition::Unknown) | Err(_) => {
                declared.disposition.unwrap_or(DataDisposition::Unknown)
            }
            Ok(disposition) => disposition,
        }
    }
}

/// Best effort: drop an archive member from its temporary directory once it
/// is known to be complete.
async fn remove_decompressed(source: &DataSource, dir: &TempDir) {
    let Some(path) = source.path() else {
        return;
    };
    if !path.starts_with(dir.path()) {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(&path).await {
        debug!(path = %path.display(), error = %e, "Could not remove decompressed file");
    }
}

/// Collapse identical declared sources into one entry per source, first
/// orientation primary and the rest as links.
fn merge_declared(declaration: &Declaration) -> Vec<MergedSource> {
    let mut merged: Vec<MergedSource> = Vec::new();
    for (orientation, declared) in declaration.iter() {
        match merged.iter_mut().find(|m| *m.declared == *declared) {
            Some(existing) => existing.links.push(orientation),
            None => merged.push(MergedSource {
                declared: Arc::new(declared.clone()),
                orientation,
                links: Vec::new(),
            }),
        }
    }
    merged
}

/// Regular files under `dir` whose path relative to `dir` matches `pattern`
/// (all files when there is none), in path order.
async fn walk_matching(dir: &Path, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let pattern = pattern
        .map(glob::Pattern::new)
        .transpose()
        .map_err(|e| IngestionError::InvalidSource(format!("invalid pattern: {}", e)))?;
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut files: Vec<PathBuf> = WalkDir::new(&dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| match &pattern {
                Some(pattern) => path
                    .strip_prefix(&dir)
                    .map(|relative| pattern.matches_path(relative))
                    .unwrap_or(false),
                None => true,
            })
            .collect();
        files.sort();
        files
    })
    .await
    .map_err(|e| IngestionError::Other(anyhow::anyhow!("directory walk failed: {}", e)))
}
