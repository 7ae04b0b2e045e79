// ABOUTME: SyncEngine - full, test-limited and incremental extract/load pipelines
// ABOUTME: Owns batching, retries, timeout/iteration guards, watermark commits and checkpoints

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::connector::Connector;
use crate::error::{SyncError, SyncResult};
use crate::sink::SinkAdapter;
use crate::source::{ExtractRequest, Row, SourceAdapter};
use crate::state::{Checkpoint, PartialProgress, StateStore};
use crate::timestamp;
use crate::type_mapper::{map_schema, ColumnSchema, SinkColumnSchema};
use crate::utils::validate_identifier;

/// One synchronizable relation. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub source_schema: String,
    pub source_table: String,
    pub sink_table: String,
    /// Empty means "ask the source".
    pub primary_key: Vec<String>,
    pub time_column: Option<String>,
    pub batch_size: usize,
}

impl SyncTarget {
    pub fn new(source_schema: &str, source_table: &str, sink_table: &str) -> Self {
        Self {
            source_schema: source_schema.to_string(),
            source_table: source_table.to_string(),
            sink_table: sink_table.to_string(),
            primary_key: Vec::new(),
            time_column: None,
            batch_size: EngineConfig::default().batch_size,
        }
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_time_column(mut self, column: &str) -> Self {
        self.time_column = Some(column.to_string());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn qualified_source(&self) -> String {
        format!("{}.{}", self.source_schema, self.source_table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Test,
    Full,
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncMode::Test => "test",
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        })
    }
}

/// Outcome of a successful pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub sink_table: String,
    pub rows_synced: u64,
    pub batches: u64,
    pub duration_ms: u64,
    /// Watermark stored after the run (incremental only).
    pub watermark: Option<String>,
    pub schema_version: u32,
}

/// Emitted after every batch written to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub sink_table: String,
    pub batch_number: u64,
    pub batch_rows: usize,
    pub total_rows: u64,
}

/// Hooks threaded through the batch loop.
#[async_trait]
pub trait BatchObserver: Send + Sync {
    /// Awaited before each batch is requested; may wait (pause).
    /// `Break` stops the run after the batch already written.
    async fn before_batch(&self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn on_batch(&self, _progress: &BatchProgress) {}
}

/// Observer that never pauses or stops.
pub struct NoopObserver;

impl BatchObserver for NoopObserver {}

#[derive(Debug, Clone, Copy)]
enum SyncPhase {
    Init,
    SchemaResolved,
    DdlReady,
    BatchLoop,
    Complete,
}

struct ResolvedSchema {
    source_columns: Vec<ColumnSchema>,
    sink_columns: Vec<SinkColumnSchema>,
    primary_key: Vec<String>,
    version: u32,
}

impl ResolvedSchema {
    fn column_names(&self) -> Vec<String> {
        self.source_columns.iter().map(|c| c.name.clone()).collect()
    }
}

struct LoopOutcome {
    rows: u64,
    batches: u64,
}

/// Runs sync pipelines against one exclusively owned source/sink pair.
pub struct SyncEngine {
    source: Box<dyn SourceAdapter>,
    sink: Box<dyn SinkAdapter>,
    state: StateStore,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(
        source: Box<dyn SourceAdapter>,
        sink: Box<dyn SinkAdapter>,
        state: StateStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            sink,
            state,
            config,
        }
    }

    /// Build an engine with fresh adapters from `connector`.
    pub async fn connect(
        connector: &dyn Connector,
        state: StateStore,
        config: EngineConfig,
    ) -> SyncResult<Self> {
        let source = connector
            .connect_source()
            .await
            .map_err(|e| SyncError::extract("connect to source", e))?;
        let sink = connector
            .connect_sink()
            .await
            .map_err(|e| SyncError::sink("connect to sink", e))?;
        Ok(Self::new(source, sink, state, config))
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Initial load into a sink assumed to be empty.
    ///
    /// Creates the sink table if absent, keyed on the primary key, then copies
    /// every source row with plain inserts. Rerunning against a populated sink
    /// inserts the rows again.
    pub async fn full_sync(
        &mut self,
        target: &SyncTarget,
        observer: &dyn BatchObserver,
    ) -> SyncResult<SyncReport> {
        let started = Instant::now();
        self.enter(SyncPhase::Init, SyncMode::Full, target);
        let schema = self.resolve_schema(target).await?;
        self.enter(SyncPhase::SchemaResolved, SyncMode::Full, target);

        let key = if schema.primary_key.is_empty() {
            tracing::warn!(
                "{} has no primary key; creating {} without one",
                target.qualified_source(),
                target.sink_table
            );
            None
        } else {
            Some(schema.primary_key.as_slice())
        };
        self.sink
            .create_table(&target.sink_table, &schema.sink_columns, key)
            .await
            .map_err(|e| SyncError::sink(format!("create table {}", target.sink_table), e))?;
        self.enter(SyncPhase::DdlReady, SyncMode::Full, target);

        let request = ExtractRequest::full(
            &target.source_schema,
            &target.source_table,
            schema.column_names(),
            schema.primary_key.clone(),
        );
        let outcome = self
            .run_batches(target, &request, &schema, None, observer)
            .await?;

        self.finish(SyncMode::Full, target, &schema, outcome, started, None)
    }

    /// Copy at most `row_limit` rows into a freshly recreated, keyless sink table.
    pub async fn test_sync(
        &mut self,
        target: &SyncTarget,
        row_limit: u64,
        observer: &dyn BatchObserver,
    ) -> SyncResult<SyncReport> {
        let started = Instant::now();
        self.enter(SyncPhase::Init, SyncMode::Test, target);
        let schema = self.resolve_schema(target).await?;
        self.enter(SyncPhase::SchemaResolved, SyncMode::Test, target);

        self.sink
            .drop_table(&target.sink_table)
            .await
            .map_err(|e| SyncError::sink(format!("drop table {}", target.sink_table), e))?;
        // Keyless: cheaper writes, duplicates are acceptable for a test load
        let keyless = map_schema(&schema.source_columns, &[]);
        self.sink
            .create_table(&target.sink_table, &keyless, None)
            .await
            .map_err(|e| SyncError::sink(format!("create table {}", target.sink_table), e))?;
        self.enter(SyncPhase::DdlReady, SyncMode::Test, target);

        let schema = ResolvedSchema {
            sink_columns: keyless,
            ..schema
        };
        let request = ExtractRequest::full(
            &target.source_schema,
            &target.source_table,
            schema.column_names(),
            schema.primary_key.clone(),
        );
        let outcome = self
            .run_batches(target, &request, &schema, Some(row_limit), observer)
            .await?;

        self.finish(SyncMode::Test, target, &schema, outcome, started, None)
    }

    /// Insert rows newer than `last_watermark`, then advance the stored watermark
    /// to `MAX(time_column)` read back from the sink.
    ///
    /// The whole attempt is retried up to `retries` times in total, with the
    /// configured fixed delay. On failure the stored watermark is untouched.
    pub async fn incremental_sync(
        &mut self,
        target: &SyncTarget,
        last_watermark: &str,
        retries: u32,
        observer: &dyn BatchObserver,
    ) -> SyncResult<SyncReport> {
        let time_column = target
            .time_column
            .clone()
            .ok_or_else(|| SyncError::Validation("incremental sync requires a time column".into()))?;
        if last_watermark.trim().is_empty() {
            return Err(SyncError::Validation(
                "incremental sync requires a last watermark".into(),
            ));
        }

        let attempts = retries.max(1);
        let mut attempt = 1;
        loop {
            match self
                .incremental_attempt(target, &time_column, last_watermark, observer)
                .await
            {
                Ok(report) => return Ok(report),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    tracing::warn!(
                        "Incremental sync of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        target.sink_table,
                        attempt,
                        attempts,
                        e,
                        self.config.retry_delay()
                    );
                    tokio::time::sleep(self.config.retry_delay()).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Incremental sync of {} failed after {} attempt(s): {}",
                        target.sink_table,
                        attempt,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn incremental_attempt(
        &mut self,
        target: &SyncTarget,
        time_column: &str,
        last_watermark: &str,
        observer: &dyn BatchObserver,
    ) -> SyncResult<SyncReport> {
        let started = Instant::now();
        self.enter(SyncPhase::Init, SyncMode::Incremental, target);
        let schema = self.resolve_schema(target).await?;
        self.enter(SyncPhase::SchemaResolved, SyncMode::Incremental, target);

        let exists = self
            .sink
            .table_exists(&target.sink_table)
            .await
            .map_err(|e| SyncError::sink(format!("check table {}", target.sink_table), e))?;
        if !exists {
            return Err(SyncError::Schema(format!(
                "sink table {} does not exist; run a full sync first",
                target.sink_table
            )));
        }

        let mut order_by = vec![time_column.to_string()];
        order_by.extend(
            schema
                .primary_key
                .iter()
                .filter(|c| c.as_str() != time_column)
                .cloned(),
        );
        let request = ExtractRequest::full(
            &target.source_schema,
            &target.source_table,
            schema.column_names(),
            order_by,
        )
        .after(time_column, last_watermark);

        tracing::info!(
            "Incremental sync of {} since {} = {}",
            target.qualified_source(),
            time_column,
            last_watermark
        );
        let outcome = self
            .run_batches(target, &request, &schema, None, observer)
            .await?;

        if outcome.rows == 0 {
            tracing::info!(
                "No rows in {} newer than {}; watermark unchanged",
                target.qualified_source(),
                last_watermark
            );
            let current = self.state.get_watermark(&target.sink_table);
            return self.finish(SyncMode::Incremental, target, &schema, outcome, started, current);
        }

        // Read back from the sink rather than trusting extracted values or the clock
        let max = self
            .sink
            .max_value(&target.sink_table, time_column)
            .await
            .map_err(|e| {
                SyncError::sink(format!("read max({}) from {}", time_column, target.sink_table), e)
            })?;
        if let Some(max) = max {
            let advanced = self
                .state
                .commit_watermark(&target.sink_table, &max)
                .map_err(SyncError::State)?;
            if advanced {
                tracing::info!(
                    "Watermark for {} advanced to {}",
                    target.sink_table,
                    timestamp::normalize(&max)
                );
            }
        }

        let current = self.state.get_watermark(&target.sink_table);
        self.finish(SyncMode::Incremental, target, &schema, outcome, started, current)
    }

    /// Snapshot every stored watermark.
    pub fn create_checkpoint(&self) -> Checkpoint {
        self.state.create_checkpoint()
    }

    /// Restore stored watermarks to `checkpoint`.
    pub fn rollback(&self, checkpoint: &Checkpoint) -> SyncResult<()> {
        self.state.rollback(checkpoint).map_err(SyncError::State)
    }

    pub fn save_partial_progress(
        &self,
        table: &str,
        rows_processed: u64,
        last_row_id: i64,
    ) -> SyncResult<()> {
        self.state
            .save_partial_progress(table, rows_processed, last_row_id)
            .map_err(SyncError::State)
    }

    pub fn load_partial_progress(&self, table: &str) -> Option<PartialProgress> {
        self.state.load_partial_progress(table)
    }

    pub fn clear_partial_progress(&self, table: &str) -> SyncResult<()> {
        self.state
            .clear_partial_progress(table)
            .map_err(SyncError::State)
    }

    async fn resolve_schema(&mut self, target: &SyncTarget) -> SyncResult<ResolvedSchema> {
        validate_target(target)?;

        let columns = self
            .source
            .table_schema(&target.source_schema, &target.source_table)
            .await
            .map_err(|e| SyncError::extract(format!("read schema of {}", target.qualified_source()), e))?;
        if columns.is_empty() {
            return Err(SyncError::Schema(format!(
                "source table {} does not exist or has no columns",
                target.qualified_source()
            )));
        }

        let primary_key = if target.primary_key.is_empty() {
            self.source
                .primary_key(&target.source_schema, &target.source_table)
                .await
                .map_err(|e| {
                    SyncError::extract(
                        format!("read primary key of {}", target.qualified_source()),
                        e,
                    )
                })?
        } else {
            target.primary_key.clone()
        };

        let has_column = |name: &str| columns.iter().any(|c| c.name == name);
        if let Some(missing) = primary_key.iter().find(|c| !has_column(c.as_str())) {
            return Err(SyncError::Schema(format!(
                "primary key column {} not found in {}",
                missing,
                target.qualified_source()
            )));
        }
        if let Some(time_column) = target.time_column.as_deref() {
            if !has_column(time_column) {
                return Err(SyncError::Schema(format!(
                    "time column {} not found in {}",
                    time_column,
                    target.qualified_source()
                )));
            }
        }

        let sink_columns = map_schema(&columns, &primary_key);
        let version = self
            .state
            .record_schema_mapping(&target.sink_table, &columns, &sink_columns)
            .map_err(SyncError::State)?;

        Ok(ResolvedSchema {
            source_columns: columns,
            sink_columns,
            primary_key,
            version,
        })
    }

    async fn run_batches(
        &mut self,
        target: &SyncTarget,
        request: &ExtractRequest,
        schema: &ResolvedSchema,
        row_limit: Option<u64>,
        observer: &dyn BatchObserver,
    ) -> SyncResult<LoopOutcome> {
        self.source.open_extract(request).await.map_err(|e| {
            SyncError::extract(format!("open extraction on {}", request.qualified_table()), e)
        })?;
        tracing::debug!("{}: {:?}", target.sink_table, SyncPhase::BatchLoop);

        let result = self.batch_loop(target, schema, row_limit, observer).await;

        if let Err(e) = self.source.close_extract().await {
            tracing::warn!(
                "Failed to close extraction on {}: {:#}",
                request.qualified_table(),
                e
            );
        }
        result
    }

    /// Pull batches until the source runs dry, the row limit is met, or a guard trips.
    async fn batch_loop(
        &mut self,
        target: &SyncTarget,
        schema: &ResolvedSchema,
        row_limit: Option<u64>,
        observer: &dyn BatchObserver,
    ) -> SyncResult<LoopOutcome> {
        let started = Instant::now();
        let max_duration = self.config.max_duration();
        let batch_size = target.batch_size.max(1);
        let id_column = schema
            .primary_key
            .first()
            .and_then(|pk| schema.source_columns.iter().position(|c| &c.name == pk));

        let mut total_rows = 0u64;
        let mut batches = 0u64;
        let mut iterations = 0u64;

        loop {
            let wanted = match row_limit {
                Some(limit) => {
                    let remaining = limit.saturating_sub(total_rows);
                    if remaining == 0 {
                        break;
                    }
                    remaining.min(batch_size as u64) as usize
                }
                None => batch_size,
            };

            if observer.before_batch().await.is_break() {
                tracing::info!(
                    "Stop requested for {} after {} rows",
                    target.sink_table,
                    total_rows
                );
                return Err(SyncError::Stopped { rows: total_rows });
            }

            if started.elapsed() > max_duration {
                return Err(SyncError::Timeout {
                    limit: max_duration,
                    batches,
                });
            }
            iterations += 1;
            if iterations > self.config.max_iterations {
                return Err(SyncError::IterationLimit {
                    max_iterations: self.config.max_iterations,
                });
            }

            let rows = self.source.fetch_batch(wanted).await.map_err(|e| {
                SyncError::extract(format!("fetch batch {} from {}", iterations, target.qualified_source()), e)
            })?;
            if rows.is_empty() {
                break;
            }
            let fetched = rows.len();

            let written = self
                .sink
                .insert_batch(&target.sink_table, &schema.sink_columns, &rows)
                .await
                .map_err(|e| {
                    SyncError::sink(
                        format!("insert {} rows into {}", fetched, target.sink_table),
                        e,
                    )
                })?;
            total_rows += written;
            batches += 1;

            let last_row_id = last_row_id(&rows, id_column).unwrap_or(total_rows as i64);
            if let Err(e) = self
                .state
                .save_partial_progress(&target.sink_table, total_rows, last_row_id)
            {
                tracing::warn!("Failed to save partial progress for {}: {:#}", target.sink_table, e);
            }

            observer.on_batch(&BatchProgress {
                sink_table: target.sink_table.clone(),
                batch_number: batches,
                batch_rows: fetched,
                total_rows,
            });

            if batches == 1 || batches % 10 == 0 {
                tracing::info!(
                    "Progress: {} - {} rows synced ({} batches)",
                    target.sink_table,
                    total_rows,
                    batches
                );
            }

            if fetched < wanted {
                break;
            }
        }

        Ok(LoopOutcome {
            rows: total_rows,
            batches,
        })
    }

    fn finish(
        &self,
        mode: SyncMode,
        target: &SyncTarget,
        schema: &ResolvedSchema,
        outcome: LoopOutcome,
        started: Instant,
        watermark: Option<String>,
    ) -> SyncResult<SyncReport> {
        if let Err(e) = self.state.clear_partial_progress(&target.sink_table) {
            tracing::warn!("Failed to clear partial progress for {}: {:#}", target.sink_table, e);
        }
        self.enter(SyncPhase::Complete, mode, target);

        let duration = started.elapsed();
        tracing::info!(
            "Completed {} sync of {} into {}: {} rows in {} batches ({:?})",
            mode,
            target.qualified_source(),
            target.sink_table,
            outcome.rows,
            outcome.batches,
            duration
        );

        Ok(SyncReport {
            mode,
            sink_table: target.sink_table.clone(),
            rows_synced: outcome.rows,
            batches: outcome.batches,
            duration_ms: duration_ms(duration),
            watermark,
            schema_version: schema.version,
        })
    }

    fn enter(&self, phase: SyncPhase, mode: SyncMode, target: &SyncTarget) {
        tracing::debug!("{} sync of {}: {:?}", mode, target.sink_table, phase);
    }
}

fn validate_target(target: &SyncTarget) -> SyncResult<()> {
    let names = [
        target.source_schema.as_str(),
        target.source_table.as_str(),
        target.sink_table.as_str(),
    ]
    .into_iter()
    .chain(target.primary_key.iter().map(|s| s.as_str()))
    .chain(target.time_column.as_deref());

    for name in names {
        validate_identifier(name).map_err(|e| SyncError::Validation(format!("{:#}", e)))?;
    }
    if target.batch_size == 0 {
        return Err(SyncError::Validation("batch size must be greater than 0".into()));
    }
    Ok(())
}

fn last_row_id(rows: &[Row], id_column: Option<usize>) -> Option<i64> {
    let idx = id_column?;
    rows.last()?.get(idx)?.as_i64()
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_target_builder() {
        let target = SyncTarget::new("public", "orders", "orders_analytics")
            .with_primary_key(&["id"])
            .with_time_column("updated_at")
            .with_batch_size(500);
        assert_eq!(target.primary_key, vec!["id".to_string()]);
        assert_eq!(target.time_column.as_deref(), Some("updated_at"));
        assert_eq!(target.batch_size, 500);
        assert_eq!(target.qualified_source(), "public.orders");
    }

    #[test]
    fn test_validate_target_rejects_bad_identifiers() {
        let target = SyncTarget::new("public", "orders; DROP", "orders");
        assert!(matches!(validate_target(&target), Err(SyncError::Validation(_))));

        let target = SyncTarget::new("public", "orders", "orders").with_batch_size(0);
        assert!(matches!(validate_target(&target), Err(SyncError::Validation(_))));

        let target = SyncTarget::new("public", "orders", "orders").with_time_column("updated-at");
        assert!(validate_target(&target).is_err());

        assert!(validate_target(&SyncTarget::new("public", "orders", "orders")).is_ok());
    }

    #[test]
    fn test_last_row_id() {
        let rows = vec![vec![json!(1), json!("a")], vec![json!(42), json!("b")]];
        assert_eq!(last_row_id(&rows, Some(0)), Some(42));
        assert_eq!(last_row_id(&rows, Some(1)), None);
        assert_eq!(last_row_id(&rows, None), None);
        assert_eq!(last_row_id(&[], Some(0)), None);
    }

    #[test]
    fn test_sync_mode_serde() {
        assert_eq!(serde_json::to_string(&SyncMode::Incremental).unwrap(), "\"incremental\"");
        assert_eq!(SyncMode::Test.to_string(), "test");
    }
}
