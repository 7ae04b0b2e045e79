// ABOUTME: End-to-end tests against a live PostgreSQL source and ClickHouse sink
// ABOUTME: Skipped unless TEST_SOURCE_URL and TEST_SINK_URL are set

use columnar_sync::config::{EngineConfig, SinkConfig, StateConfig, SyncConfig};
use columnar_sync::connector::PostgresClickHouseConnector;
use columnar_sync::engine::{NoopObserver, SyncEngine, SyncTarget};
use columnar_sync::sink::{ClickHouseSink, SinkAdapter};
use columnar_sync::state::StateStore;
use std::env;
use tempfile::TempDir;

/// Helper to get test endpoints from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let sink = env::var("TEST_SINK_URL").ok()?;
    Some((source, sink))
}

fn config(source: &str, sink: &str) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.source.url = Some(source.to_string());
    config.sink.url = Some(sink.to_string());
    config
}

#[tokio::test]
async fn test_full_then_incremental_roundtrip() {
    let Some((source_url, sink_url)) = get_test_urls() else {
        println!("Skipping live sync test: TEST_SOURCE_URL / TEST_SINK_URL not set");
        return;
    };
    let table = "columnar_sync_live_events";

    let client = columnar_sync::postgres::connect(&source_url).await.unwrap();
    client
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS "public"."{table}";
            CREATE TABLE "public"."{table}" (
                id BIGSERIAL PRIMARY KEY,
                name TEXT,
                amount NUMERIC(12, 2),
                payload JSONB,
                updated_at TIMESTAMP NOT NULL
            );
            INSERT INTO "public"."{table}" (name, amount, payload, updated_at)
            SELECT 'row-' || g, g * 1.25, jsonb_build_object('n', g),
                   TIMESTAMP '2024-01-01 00:00:00' + g * INTERVAL '1 second'
            FROM generate_series(1, 2500) AS g;
            "#
        ))
        .await
        .unwrap();

    let mut sink = ClickHouseSink::new(&SinkConfig {
        url: Some(sink_url.clone()),
        ..SinkConfig::default()
    })
    .unwrap();
    sink.drop_table(table).await.unwrap();

    let dir = TempDir::new().unwrap();
    let connector = PostgresClickHouseConnector::new(config(&source_url, &sink_url)).unwrap();
    let engine_config = EngineConfig {
        batch_size: 1000,
        retry_delay_secs: 1,
        ..EngineConfig::default()
    };
    let mut engine = SyncEngine::connect(
        &connector,
        StateStore::new(&StateConfig::in_dir(dir.path())),
        engine_config,
    )
    .await
    .unwrap();
    let target = SyncTarget::new("public", table, table)
        .with_time_column("updated_at")
        .with_batch_size(1000);

    let report = engine.full_sync(&target, &NoopObserver).await.unwrap();
    assert_eq!(report.rows_synced, 2500);
    assert_eq!(report.batches, 3);
    assert_eq!(sink.row_count(table).await.unwrap(), 2500);

    client
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{table}" (name, amount, payload, updated_at)
               SELECT 'late-' || g, g, NULL, TIMESTAMP '2024-01-02 00:00:00' + g * INTERVAL '1 second'
               FROM generate_series(1, 10) AS g"#
        ))
        .await
        .unwrap();

    let report = engine
        .incremental_sync(&target, "2024-01-01T00:41:40", 3, &NoopObserver)
        .await
        .unwrap();
    assert_eq!(report.rows_synced, 10);
    assert_eq!(report.watermark.as_deref(), Some("2024-01-02T00:00:10"));
    assert_eq!(sink.row_count(table).await.unwrap(), 2510);

    // Nothing newer: zero rows, watermark unchanged
    let report = engine
        .incremental_sync(&target, "2024-01-02T00:00:10", 3, &NoopObserver)
        .await
        .unwrap();
    assert_eq!(report.rows_synced, 0);
    assert_eq!(report.watermark.as_deref(), Some("2024-01-02T00:00:10"));

    sink.drop_table(table).await.unwrap();
    client
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "public"."{table}""#))
        .await
        .unwrap();
}
