//! Time-series ingester service.
//!
//! Operations front end for the ingest store: schema setup, loading
//! declarations, status of a source and removal of abandoned sources. Every
//! command prints its outcome as JSON on stdout.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, info_span, warn, Instrument, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use config::{load_declaration, IngesterConfig};
use ingestion::{LoadOutcome, ReaderRegistry, SourceLoader, TimeSeriesIngester};
use storage::{Catalog, PgLockManager};

#[derive(Parser, Debug)]
#[command(name = "ingester")]
#[command(about = "Content-addressed time-series ingester")]
struct Args {
    /// Configuration file path (environment variables when absent)
    #[arg(short, long, env = "INGESTER_CONFIG")]
    config: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema if it does not exist
    Migrate,

    /// Ingest the sources named by a declaration file
    Load {
        /// Declaration YAML path
        #[arg(short, long)]
        declaration: String,
    },

    /// Registry and completion state of a source
    Status {
        /// Content hash of the source
        #[arg(long)]
        hash: String,
    },

    /// Remove every abandoned source
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => IngesterConfig::from_yaml(path)?,
        None => IngesterConfig::from_env()?,
    };

    let span = info_span!("ingester", run_id = %Uuid::new_v4());
    let output = run(args.command, config).instrument(span).await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(command: Command, config: IngesterConfig) -> Result<Value> {
    info!(command = ?command, "Starting ingester");

    let catalog = Arc::new(
        Catalog::connect(&config.database_url, config.max_connections)
            .await
            .context("Failed to connect to the catalog database")?,
    );

    if let Command::Migrate = command {
        catalog.migrate().await?;
        info!("Schema is up to date");
        return Ok(json!({ "migrated": true }));
    }

    let locks = Arc::new(
        PgLockManager::connect(&config.database_url, config.ingest.lock_poll_interval())
            .await
            .context("Failed to open the lock session")?,
    );
    let ingester = TimeSeriesIngester::new(catalog.clone(), catalog, locks, config.ingest);

    match command {
        Command::Migrate => Ok(json!({ "migrated": true })),
        Command::Status { hash } => {
            let status = ingester.status(&hash).await?;
            Ok(json!({ "hash": hash, "state": status }))
        }
        Command::Clean => {
            let removed = ingester.remove_abandoned().await?;
            info!(removed = removed.len(), "Removed abandoned sources");
            Ok(json!({ "removed": removed }))
        }
        Command::Load { declaration } => {
            let declaration = load_declaration(&declaration)?;
            // Gridded sources need no reader; readers for other formats are
            // registered by embedding applications.
            let loader = SourceLoader::new(ingester, ReaderRegistry::new());
            let outcome = loader.load(&declaration).await;
            if !outcome.is_success() {
                warn!(failures = outcome.failures.len(), "Some sources failed");
            }
            Ok(summarize(&outcome))
        }
    }
}

fn summarize(outcome: &LoadOutcome) -> Value {
    let results: Vec<Value> = outcome
        .results
        .iter()
        .map(|r| {
            json!({
                "source_id": r.source_id(),
                "found_already": r.found_already(),
                "requires_retry": r.requires_retry(),
                "counts": r.counts(),
            })
        })
        .collect();
    let failures: Vec<Value> = outcome
        .failures
        .iter()
        .map(|f| json!({ "uri": f.uri, "error": f.error.to_string() }))
        .collect();
    let skipped: Vec<Value> = outcome
        .skipped
        .iter()
        .map(|s| json!({ "uri": s.uri, "reason": s.reason }))
        .collect();

    json!({
        "results": results,
        "failures": failures,
        "skipped": skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestion::{IngestResult, SkippedSource, SourceFailure};
    use ts_common::{DataDisposition, DataSource, DatasetOrientation, DeclaredSource};

    #[test]
    fn test_parse_status_command() {
        let args = Args::try_parse_from(["ingester", "status", "--hash", "ABC"]).unwrap();
        assert_eq!(args.log_level, "info");
        match args.command {
            Command::Status { hash } => assert_eq!(hash, "ABC"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_load_with_config() {
        let args = Args::try_parse_from([
            "ingester",
            "--config",
            "/etc/ingester.yaml",
            "--log-level",
            "debug",
            "load",
            "--declaration",
            "/etc/declaration.yaml",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("/etc/ingester.yaml"));
        assert!(matches!(args.command, Command::Load { .. }));
    }

    #[test]
    fn test_missing_subcommand_rejected() {
        assert!(Args::try_parse_from(["ingester"]).is_err());
    }

    #[test]
    fn test_summarize_outcome() {
        let source = DataSource::new(
            DataDisposition::NetcdfGridded,
            "/grids/a_f001.nc",
            DatasetOrientation::Right,
            Vec::new(),
            Arc::new(DeclaredSource::new("/grids")),
        );
        let outcome = LoadOutcome {
            results: vec![IngestResult::new(&source, 7, true, false).unwrap()],
            failures: vec![SourceFailure {
                uri: "/grids/b.nc".to_string(),
                error: ingestion::IngestionError::Decompression("bad header".to_string()),
            }],
            skipped: vec![SkippedSource {
                uri: "https://example.org".to_string(),
                reason: "web source declares no disposition".to_string(),
            }],
        };

        let summary = summarize(&outcome);
        assert_eq!(summary["results"][0]["source_id"], 7);
        assert_eq!(summary["results"][0]["counts"]["right"], 1);
        assert_eq!(summary["failures"][0]["uri"], "/grids/b.nc");
        assert_eq!(summary["skipped"].as_array().unwrap().len(), 1);
    }
}
