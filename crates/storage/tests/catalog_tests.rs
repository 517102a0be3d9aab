//! PostgreSQL-backed catalog and lock tests.
//!
//! Skipped unless `TEST_DATABASE_URL` points at a disposable database.

use std::sync::Arc;
use std::time::Duration;

use storage::{
    Catalog, PgLockManager, ReferenceKeys, SourceLockManager, SourceRecord, SourceStore, ValueRow,
};
use test_utils::{require_database, unique_hash};

fn record(hash: &str) -> SourceRecord {
    SourceRecord {
        hash: hash.to_string(),
        path: "/data/catalog_tests.csv".to_string(),
        variable_name: "streamflow".to_string(),
        measurement_unit_id: None,
        feature_id: None,
        time_scale_id: None,
        lead_minutes: None,
        is_point_data: true,
    }
}

async fn catalog(url: &str) -> Catalog {
    let catalog = Catalog::connect(url, 10).await.expect("connect");
    catalog.migrate().await.expect("migrate");
    catalog
}

// ============================================================================
// Registration tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_registration_inserts_once() {
    let url = require_database!();
    let catalog = Arc::new(catalog(&url).await);
    let hash = unique_hash("race");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let catalog = Arc::clone(&catalog);
            let record = record(&hash);
            tokio::spawn(async move { catalog.register_source(&record).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap().unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| o.inserted).count(), 1);
    let id = outcomes[0].source_id;
    assert!(outcomes.iter().all(|o| o.source_id == id));
}

#[tokio::test]
async fn test_registration_race_across_pools() {
    let url = require_database!();
    let mut catalogs = Vec::new();
    for _ in 0..4 {
        catalogs.push(Arc::new(catalog(&url).await));
    }
    let hash = unique_hash("pools");

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let catalog = Arc::clone(&catalogs[i % catalogs.len()]);
            let record = record(&hash);
            tokio::spawn(async move { catalog.register_source(&record).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap().unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| o.inserted).count(), 1);
    let id = outcomes[0].source_id;
    assert!(outcomes.iter().all(|o| o.source_id == id));
}

#[tokio::test]
async fn test_completion_and_removal() {
    let url = require_database!();
    let catalog = catalog(&url).await;

    let source = catalog.register_source(&record(&unique_hash("done"))).await.unwrap();
    let ensemble = catalog.ensemble_id("default").await.unwrap();
    let series = catalog.insert_time_series(source.source_id, ensemble).await.unwrap();
    let rows = [
        ValueRow { time_series_id: series, lead_minutes: 60, value: Some(30.0) },
        ValueRow { time_series_id: series, lead_minutes: 60, value: Some(31.0) },
        ValueRow { time_series_id: series, lead_minutes: 120, value: None },
    ];
    assert_eq!(catalog.insert_values(&rows).await.unwrap(), 2);

    assert!(!catalog.was_completed(source.source_id).await.unwrap());
    assert!(catalog.mark_complete(source.source_id).await.unwrap());
    assert!(!catalog.mark_complete(source.source_id).await.unwrap());
    assert!(catalog.was_completed(source.source_id).await.unwrap());
    assert!(!catalog.remove_source(source.source_id).await.unwrap());

    let open = catalog.register_source(&record(&unique_hash("open"))).await.unwrap();
    assert!(catalog.remove_source(open.source_id).await.unwrap());
}

// ============================================================================
// Advisory lock tests
// ============================================================================

#[tokio::test]
async fn test_advisory_lock_excludes_other_sessions() {
    let url = require_database!();
    let catalog = catalog(&url).await;
    let source = catalog.register_source(&record(&unique_hash("lock"))).await.unwrap();

    let first = PgLockManager::connect(&url, Duration::from_millis(5)).await.unwrap();
    let second = PgLockManager::connect(&url, Duration::from_millis(5)).await.unwrap();

    assert!(first.try_lock_source(source.source_id).await.unwrap());
    assert!(!first.try_lock_source(source.source_id).await.unwrap());
    assert!(!second.try_lock_source(source.source_id).await.unwrap());
    assert!(second.is_source_locked(source.source_id).await.unwrap());

    first.unlock_source(source.source_id).await.unwrap();
    assert!(!second.is_source_locked(source.source_id).await.unwrap());
    second.lock_source(source.source_id).await.unwrap();
    second.unlock_source(source.source_id).await.unwrap();
}
