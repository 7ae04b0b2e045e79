// ABOUTME: SyncWorker - runs one engine pipeline on a dedicated thread with its own runtime
// ABOUTME: Publishes a status state machine and bounded progress messages; pause/resume/stop are cooperative

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

use crate::config::SyncConfig;
use crate::connector::Connector;
use crate::engine::{BatchObserver, BatchProgress, SyncEngine, SyncMode, SyncReport, SyncTarget};
use crate::error::{SyncError, SyncResult};
use crate::state::StateStore;

/// What to run. Unset fields fall back to `[defaults]` and `[sync]` in the config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncParams {
    pub mode: SyncMode,
    pub source_schema: Option<String>,
    pub source_table: Option<String>,
    pub sink_table: Option<String>,
    /// Comma-separated column list.
    pub primary_key: Option<String>,
    pub time_column: Option<String>,
    pub last_watermark: Option<String>,
    pub row_limit: Option<u64>,
    pub batch_size: Option<usize>,
    pub retries: Option<u32>,
    /// Enables percentage and ETA in progress messages.
    pub expected_rows: Option<u64>,
}

impl SyncParams {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            source_schema: None,
            source_table: None,
            sink_table: None,
            primary_key: None,
            time_column: None,
            last_watermark: None,
            row_limit: None,
            batch_size: None,
            retries: None,
            expected_rows: None,
        }
    }

    pub fn table(mut self, source_table: &str) -> Self {
        self.source_table = Some(source_table.to_string());
        self
    }

    pub fn sink_table(mut self, sink_table: &str) -> Self {
        self.sink_table = Some(sink_table.to_string());
        self
    }

    pub fn time_column(mut self, column: &str) -> Self {
        self.time_column = Some(column.to_string());
        self
    }

    pub fn last_watermark(mut self, watermark: &str) -> Self {
        self.last_watermark = Some(watermark.to_string());
        self
    }

    /// Resolve the effective target. Explicit parameters win over config defaults.
    pub fn resolve(&self, config: &SyncConfig) -> SyncResult<SyncTarget> {
        let defaults = &config.defaults;
        let source_table = self
            .source_table
            .clone()
            .or_else(|| defaults.source_table.clone())
            .ok_or_else(|| SyncError::Validation("source table is required".into()))?;
        let sink_table = self
            .sink_table
            .clone()
            .or_else(|| defaults.sink_table.clone())
            .unwrap_or_else(|| source_table.clone());
        let primary_key = self
            .primary_key
            .as_deref()
            .or(defaults.primary_key.as_deref())
            .map(split_columns)
            .unwrap_or_default();
        let time_column = self
            .time_column
            .clone()
            .or_else(|| defaults.time_column.clone());

        if self.mode == SyncMode::Incremental {
            if time_column.is_none() {
                return Err(SyncError::Validation(
                    "incremental sync requires a time column".into(),
                ));
            }
            if self.last_watermark.as_deref().map_or(true, |w| w.trim().is_empty()) {
                return Err(SyncError::Validation(
                    "incremental sync requires a last watermark".into(),
                ));
            }
        }
        if self.row_limit == Some(0) {
            return Err(SyncError::Validation("row limit must be greater than 0".into()));
        }

        Ok(SyncTarget {
            source_schema: self
                .source_schema
                .clone()
                .unwrap_or_else(|| defaults.source_schema.clone()),
            source_table,
            sink_table,
            primary_key,
            time_column,
            batch_size: self.batch_size.unwrap_or(config.sync.batch_size),
        })
    }
}

fn split_columns(list: &str) -> Vec<String> {
    list.split(',')
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(|c| c.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Completed | WorkerState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressData {
    pub total_rows: u64,
    pub batch_rows: usize,
    /// Seconds since the worker started.
    pub elapsed_time: f64,
    pub rows_per_second: f64,
    pub percentage: Option<f64>,
    /// Estimated seconds remaining.
    pub eta: Option<f64>,
}

impl ProgressData {
    fn compute(total_rows: u64, batch_rows: usize, elapsed: f64, expected: Option<u64>) -> Self {
        let rows_per_second = if elapsed > 0.0 {
            total_rows as f64 / elapsed
        } else {
            0.0
        };
        let percentage = expected
            .filter(|e| *e > 0)
            .map(|e| (total_rows as f64 / e as f64 * 100.0).min(100.0));
        let eta = expected.filter(|_| rows_per_second > 0.0).map(|e| {
            let remaining = e.saturating_sub(total_rows) as f64;
            remaining / rows_per_second
        });
        Self {
            total_rows,
            batch_rows,
            elapsed_time: elapsed,
            rows_per_second,
            percentage,
            eta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub trace: String,
}

impl ErrorInfo {
    fn from_error(err: &SyncError) -> Self {
        let mut trace = format!("{}", err);
        let mut cause = std::error::Error::source(err);
        while let Some(inner) = cause {
            trace.push_str(&format!("\nCaused by: {}", inner));
            cause = inner.source();
        }
        Self {
            message: err.to_string(),
            trace,
        }
    }

    fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self {
            message: format!("sync worker panicked: {}", detail),
            trace: detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: WorkerState,
    pub progress: Option<ProgressData>,
    pub result: Option<SyncReport>,
    pub error: Option<ErrorInfo>,
}

impl SyncStatus {
    pub fn idle() -> Self {
        Self {
            state: WorkerState::Idle,
            progress: None,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteData {
    pub total_rows: u64,
    pub duration_ms: u64,
    pub watermark: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress(ProgressData),
    Complete(CompleteData),
    Error(ErrorInfo),
}

/// One message on the progress channel: `{type, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressMessage {
    #[serde(flatten)]
    pub event: ProgressEvent,
    /// Local wall-clock time, HH:MM:SS.
    pub timestamp: String,
}

impl ProgressMessage {
    fn now(event: ProgressEvent) -> Self {
        Self {
            event,
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
        }
    }
}

/// State shared between the worker handle and its thread.
struct Shared {
    status: Mutex<SyncStatus>,
    stop: AtomicBool,
    /// `true` while paused.
    paused: watch::Sender<bool>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, SyncStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Runs one sync operation on a dedicated thread.
///
/// The thread builds its own current-thread runtime and a fresh engine through
/// the connector, so adapters never outlive or escape one run.
pub struct SyncWorker {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    params: SyncParams,
    progress: Option<mpsc::Sender<ProgressMessage>>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        params: SyncParams,
        progress: Option<mpsc::Sender<ProgressMessage>>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            config,
            connector,
            params,
            progress,
            shared: Arc::new(Shared {
                status: Mutex::new(SyncStatus::idle()),
                stop: AtomicBool::new(false),
                paused,
            }),
            handle: None,
        }
    }

    pub fn params(&self) -> &SyncParams {
        &self.params
    }

    /// Spawn the worker thread.
    ///
    /// Fails with `AlreadyRunning` while a previous run's thread is alive and
    /// with `Validation` when the parameters do not resolve to a target.
    pub fn start(&mut self) -> SyncResult<()> {
        if self.is_alive() {
            return Err(SyncError::AlreadyRunning);
        }
        let target = self.params.resolve(&self.config)?;

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.paused.send_replace(false);
        *self.shared.status() = SyncStatus {
            state: WorkerState::Running,
            ..SyncStatus::idle()
        };

        let run = WorkerRun {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            params: self.params.clone(),
            target,
            progress: self.progress.clone(),
            shared: Arc::clone(&self.shared),
        };
        let handle = std::thread::Builder::new()
            .name("columnar-sync-worker".to_string())
            .spawn(move || run.run())
            .map_err(|e| {
                *self.shared.status() = SyncStatus::idle();
                SyncError::Spawn(e)
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.status().clone()
    }

    /// Hold the run before its next batch. Returns false unless running.
    pub fn pause(&self) -> bool {
        let mut status = self.shared.status();
        if status.state != WorkerState::Running {
            return false;
        }
        self.shared.paused.send_replace(true);
        status.state = WorkerState::Paused;
        tracing::info!("Sync pause requested");
        true
    }

    /// Returns false unless paused.
    pub fn resume(&self) -> bool {
        let mut status = self.shared.status();
        if status.state != WorkerState::Paused {
            return false;
        }
        self.shared.paused.send_replace(false);
        status.state = WorkerState::Running;
        tracing::info!("Sync resumed");
        true
    }

    /// Ask the run to end before its next batch. A paused run is released so it can exit.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.paused.send_replace(false);
        tracing::info!("Sync stop requested");
    }

    /// Block until the worker thread exits and return the final status.
    pub fn join(&mut self) -> SyncStatus {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Sync worker thread terminated abnormally");
            }
        }
        self.status()
    }
}

/// Everything the worker thread owns.
struct WorkerRun {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    params: SyncParams,
    target: SyncTarget,
    progress: Option<mpsc::Sender<ProgressMessage>>,
    shared: Arc<Shared>,
}

impl WorkerRun {
    /// Dispatch boundary: nothing escapes this function, panics included.
    fn run(self) {
        let shared = Arc::clone(&self.shared);
        let progress = self.progress.clone();
        let sink_table = self.target.sink_table.clone();

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(ErrorInfo::from_error(&e)),
            Err(payload) => Err(ErrorInfo::from_panic(payload.as_ref())),
        };

        let event = match outcome {
            Ok(report) => {
                let data = CompleteData {
                    total_rows: report.rows_synced,
                    duration_ms: report.duration_ms,
                    watermark: report.watermark.clone(),
                };
                let mut status = shared.status();
                status.state = WorkerState::Completed;
                status.result = Some(report);
                ProgressEvent::Complete(data)
            }
            Err(info) => {
                tracing::error!("Sync of {} failed: {}", sink_table, info.trace);
                let mut status = shared.status();
                status.state = WorkerState::Error;
                status.error = Some(info.clone());
                ProgressEvent::Error(info)
            }
        };
        send(progress.as_ref(), ProgressMessage::now(event));
    }

    fn execute(self) -> SyncResult<SyncReport> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SyncError::Spawn)?;

        runtime.block_on(async {
            let state = StateStore::new(&self.config.state);
            let mut engine =
                SyncEngine::connect(self.connector.as_ref(), state, self.config.sync.clone())
                    .await?;
            let observer = WorkerObserver {
                shared: Arc::clone(&self.shared),
                progress: self.progress.clone(),
                started: Instant::now(),
                expected_rows: self.params.expected_rows,
            };

            tracing::info!(
                "Starting {} sync: {} -> {}",
                self.params.mode,
                self.target.qualified_source(),
                self.target.sink_table
            );
            match self.params.mode {
                SyncMode::Full => engine.full_sync(&self.target, &observer).await,
                SyncMode::Test => {
                    let limit = self
                        .params
                        .row_limit
                        .unwrap_or(self.config.sync.test_row_limit);
                    engine.test_sync(&self.target, limit, &observer).await
                }
                SyncMode::Incremental => {
                    let watermark = self.params.last_watermark.as_deref().ok_or_else(|| {
                        SyncError::Validation("incremental sync requires a last watermark".into())
                    })?;
                    let retries = self
                        .params
                        .retries
                        .unwrap_or(self.config.sync.retry_attempts);
                    engine
                        .incremental_sync(&self.target, watermark, retries, &observer)
                        .await
                }
            }
        })
    }
}

fn send(progress: Option<&mpsc::Sender<ProgressMessage>>, message: ProgressMessage) {
    if let Some(tx) = progress {
        // Status stays authoritative when the reader falls behind
        if let Err(e) = tx.try_send(message) {
            tracing::debug!("Progress message dropped: {}", e);
        }
    }
}

/// Bridges engine batch hooks to worker status, flags and channel.
struct WorkerObserver {
    shared: Arc<Shared>,
    progress: Option<mpsc::Sender<ProgressMessage>>,
    started: Instant,
    expected_rows: Option<u64>,
}

#[async_trait]
impl BatchObserver for WorkerObserver {
    async fn before_batch(&self) -> ControlFlow<()> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return ControlFlow::Break(());
        }

        let mut paused = self.shared.paused.subscribe();
        if *paused.borrow() {
            tracing::info!("Sync paused between batches");
        }
        if paused.wait_for(|p| !*p).await.is_err() {
            return ControlFlow::Break(());
        }

        if self.shared.stop.load(Ordering::SeqCst) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn on_batch(&self, progress: &BatchProgress) {
        let data = ProgressData::compute(
            progress.total_rows,
            progress.batch_rows,
            self.started.elapsed().as_secs_f64(),
            self.expected_rows,
        );
        self.shared.status().progress = Some(data.clone());
        send(
            self.progress.as_ref(),
            ProgressMessage::now(ProgressEvent::Progress(data)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_prefers_explicit_params() {
        let mut config = SyncConfig::default();
        config.defaults.source_table = Some("orders".into());
        config.defaults.primary_key = Some("id".into());
        config.sync.batch_size = 250;

        let target = SyncParams::new(SyncMode::Full).resolve(&config).unwrap();
        assert_eq!(target.source_schema, "public");
        assert_eq!(target.source_table, "orders");
        assert_eq!(target.sink_table, "orders");
        assert_eq!(target.primary_key, vec!["id".to_string()]);
        assert_eq!(target.batch_size, 250);

        let mut params = SyncParams::new(SyncMode::Full)
            .table("events")
            .sink_table("events_ch");
        params.primary_key = Some("tenant_id, id".into());
        let target = params.resolve(&config).unwrap();
        assert_eq!(target.source_table, "events");
        assert_eq!(target.sink_table, "events_ch");
        assert_eq!(target.primary_key, vec!["tenant_id".to_string(), "id".to_string()]);
    }

    #[test]
    fn test_resolve_validates_incremental() {
        let config = SyncConfig::default();
        assert!(matches!(
            SyncParams::new(SyncMode::Full).resolve(&config),
            Err(SyncError::Validation(_))
        ));

        let params = SyncParams::new(SyncMode::Incremental).table("events");
        assert!(matches!(params.resolve(&config), Err(SyncError::Validation(_))));

        let params = params.time_column("updated_at");
        assert!(matches!(params.resolve(&config), Err(SyncError::Validation(_))));

        let params = params.last_watermark("2024-01-01T00:00:00");
        assert!(params.resolve(&config).is_ok());
    }

    #[test]
    fn test_progress_data() {
        let data = ProgressData::compute(500, 100, 2.0, Some(1000));
        assert_eq!(data.rows_per_second, 250.0);
        assert_eq!(data.percentage, Some(50.0));
        assert_eq!(data.eta, Some(2.0));

        let data = ProgressData::compute(500, 100, 0.0, None);
        assert_eq!(data.rows_per_second, 0.0);
        assert_eq!(data.percentage, None);
        assert_eq!(data.eta, None);

        let data = ProgressData::compute(1200, 200, 1.0, Some(1000));
        assert_eq!(data.percentage, Some(100.0));
        assert_eq!(data.eta, Some(0.0));
    }

    #[test]
    fn test_progress_message_shape() {
        let message = ProgressMessage {
            event: ProgressEvent::Complete(CompleteData {
                total_rows: 3,
                duration_ms: 10,
                watermark: None,
            }),
            timestamp: "12:00:00".into(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "complete",
                "data": {"totalRows": 3, "durationMs": 10, "watermark": null},
                "timestamp": "12:00:00"
            })
        );
    }

    #[test]
    fn test_error_info_includes_cause() {
        let err = SyncError::sink("insert into events", anyhow::anyhow!("connection reset"));
        let info = ErrorInfo::from_error(&err);
        assert_eq!(info.message, "sink error: insert into events");
        assert!(info.trace.contains("Caused by: connection reset"));
    }
}
