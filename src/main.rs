// ABOUTME: CLI entry point for columnar-sync
// ABOUTME: Parses commands and drives syncs, checkpoints and lock maintenance

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use columnar_sync::config::SyncConfig;
use columnar_sync::connector::PostgresClickHouseConnector;
use columnar_sync::lock::SyncLock;
use columnar_sync::state::{Checkpoint, StateStore};
use columnar_sync::worker::{ProgressData, ProgressEvent};
use columnar_sync::{SyncMode, SyncParams, SyncService, WorkerState};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "columnar-sync")]
#[command(about = "Batch sync from PostgreSQL into ClickHouse", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a columnar-sync TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct TableArgs {
    /// PostgreSQL connection string
    #[arg(long, env = "COLUMNAR_SYNC_SOURCE_URL")]
    source: Option<String>,
    /// ClickHouse HTTP endpoint
    #[arg(long, env = "COLUMNAR_SYNC_SINK_URL")]
    sink: Option<String>,
    /// Source schema (default from config, then "public")
    #[arg(long)]
    schema: Option<String>,
    /// Source table
    #[arg(long)]
    table: Option<String>,
    /// Sink table (defaults to the source table name)
    #[arg(long)]
    sink_table: Option<String>,
    /// Primary key columns (comma-separated); discovered from the source if omitted
    #[arg(long)]
    primary_key: Option<String>,
    /// Rows per batch
    #[arg(long)]
    batch_size: Option<usize>,
    /// Expected row count, enables percentage and ETA
    #[arg(long)]
    expected_rows: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy rows from the source into the sink
    Sync {
        #[command(subcommand)]
        mode: SyncCommand,
    },
    /// Show lock holder, stored watermarks and partial progress
    Status,
    /// Save or restore the watermark map
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointCommand,
    },
    /// Force-remove the sync lock file
    Unlock,
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Initial load of the whole table into an empty sink table
    Full {
        #[command(flatten)]
        table: TableArgs,
    },
    /// Load at most --row-limit rows into a recreated, keyless sink table
    Test {
        #[command(flatten)]
        table: TableArgs,
        /// Rows to copy (default from config)
        #[arg(long)]
        row_limit: Option<u64>,
    },
    /// Insert rows newer than the watermark and advance it
    Incremental {
        #[command(flatten)]
        table: TableArgs,
        /// Column holding the row's modification time
        #[arg(long)]
        time_column: Option<String>,
        /// Lower bound; defaults to the stored watermark for the sink table
        #[arg(long)]
        watermark: Option<String>,
        /// Total attempts before giving up (default from config)
        #[arg(long)]
        retries: Option<u32>,
    },
}

#[derive(Subcommand)]
enum CheckpointCommand {
    /// Write the current watermarks to a file
    Save { file: PathBuf },
    /// Replace stored watermarks with a saved checkpoint
    Restore { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    columnar_sync::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let config = SyncConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync { mode } => {
            let (table, params) = match mode {
                SyncCommand::Full { table } => {
                    let params = table_params(SyncMode::Full, &table);
                    (table, params)
                }
                SyncCommand::Test { table, row_limit } => {
                    let mut params = table_params(SyncMode::Test, &table);
                    params.row_limit = row_limit;
                    (table, params)
                }
                SyncCommand::Incremental {
                    table,
                    time_column,
                    watermark,
                    retries,
                } => {
                    let mut params = table_params(SyncMode::Incremental, &table);
                    params.time_column = time_column;
                    params.last_watermark = watermark;
                    params.retries = retries;
                    (table, params)
                }
            };
            run_sync(config, &table, params).await
        }
        Commands::Status => show_status(&config),
        Commands::Checkpoint { action } => match action {
            CheckpointCommand::Save { file } => {
                let checkpoint = StateStore::new(&config.state).create_checkpoint();
                checkpoint.save(&file)?;
                println!(
                    "✓ Saved {} watermark(s) to {}",
                    checkpoint.watermarks.len(),
                    file.display()
                );
                Ok(())
            }
            CheckpointCommand::Restore { file } => restore_checkpoint(&config, &file),
        },
        Commands::Unlock => {
            let lock = SyncLock::new(config.state.lock_file.clone(), config.state.lock_stale_after());
            match lock.lock_info() {
                Some(record) => tracing::warn!(
                    "Removing lock held by pid {} on {}",
                    record.pid,
                    record.hostname
                ),
                None => tracing::info!("No active lock at {}", lock.path().display()),
            }
            lock.release();
            println!("✓ Lock file removed");
            Ok(())
        }
    }
}

fn table_params(mode: SyncMode, table: &TableArgs) -> SyncParams {
    let mut params = SyncParams::new(mode);
    params.source_schema = table.schema.clone();
    params.source_table = table.table.clone();
    params.sink_table = table.sink_table.clone();
    params.primary_key = table.primary_key.clone();
    params.batch_size = table.batch_size;
    params.expected_rows = table.expected_rows;
    params
}

async fn run_sync(mut config: SyncConfig, table: &TableArgs, mut params: SyncParams) -> anyhow::Result<()> {
    if table.source.is_some() {
        config.source.url = table.source.clone();
    }
    if table.sink.is_some() {
        config.sink.url = table.sink.clone();
    }

    if params.mode == SyncMode::Incremental && params.last_watermark.is_none() {
        let mut lookup = params.clone();
        lookup.mode = SyncMode::Full;
        let sink_table = lookup.resolve(&config)?.sink_table;
        let stored = StateStore::new(&config.state).get_watermark(&sink_table);
        params.last_watermark = Some(stored.with_context(|| {
            format!(
                "No stored watermark for {}. Pass --watermark or run a full sync first",
                sink_table
            )
        })?);
    }

    let connector = Arc::new(PostgresClickHouseConnector::new(config.clone())?);
    let mut service = SyncService::new(config, connector);
    service.try_start(params.clone()).context("Failed to start sync")?;

    // Stop cooperatively on Ctrl+C; the in-flight batch still completes
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, stopping after the current batch");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let bar = progress_bar(params.expected_rows)?;
    let mut stop_sent = false;
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        if interrupted.load(Ordering::SeqCst) && !stop_sent {
            service.stop();
            stop_sent = true;
        }

        if let Some(message) = service.check_and_update_progress() {
            if let ProgressEvent::Progress(data) = &message.event {
                render(&bar, data);
            }
        }
        if service.status().state.is_terminal() {
            break;
        }
    }
    bar.finish_and_clear();

    let status = service.wait();
    match (status.state, status.result, status.error) {
        (WorkerState::Completed, Some(report), _) => {
            println!(
                "✓ {} sync complete: {} rows into {} in {} batches ({:.1}s)",
                report.mode,
                report.rows_synced,
                report.sink_table,
                report.batches,
                report.duration_ms as f64 / 1000.0
            );
            if let Some(watermark) = report.watermark {
                println!("  Watermark: {}", watermark);
            }
            Ok(())
        }
        (_, _, Some(error)) => {
            tracing::debug!("{}", error.trace);
            anyhow::bail!("Sync failed: {}", error.message)
        }
        (state, _, _) => anyhow::bail!("Sync ended in unexpected state {:?}", state),
    }
}

fn progress_bar(expected_rows: Option<u64>) -> anyhow::Result<ProgressBar> {
    let bar = match expected_rows {
        Some(total) => {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} rows {msg}")?
                    .progress_chars("█▓▒░"),
            );
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
            bar
        }
    };
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

fn render(bar: &ProgressBar, data: &ProgressData) {
    bar.set_position(data.total_rows);
    let mut message = format!("{} rows, {:.0} rows/s", data.total_rows, data.rows_per_second);
    if let Some(eta) = data.eta {
        message.push_str(&format!(", ETA {:.0}s", eta));
    }
    bar.set_message(message);
}

fn show_status(config: &SyncConfig) -> anyhow::Result<()> {
    let lock = SyncLock::new(config.state.lock_file.clone(), config.state.lock_stale_after());
    match lock.lock_info() {
        Some(record) => println!(
            "Lock:      held by pid {} on {} for {}s",
            record.pid,
            record.hostname,
            record.age().as_secs()
        ),
        None => println!("Lock:      free"),
    }

    let state = StateStore::new(&config.state);
    let watermarks = state.watermarks();
    println!();
    println!("Watermarks:");
    if watermarks.is_empty() {
        println!("  (none)");
    }
    for (table, value) in &watermarks {
        let version = state
            .latest_schema_mapping(table)
            .map(|(v, _)| format!(" (schema v{})", v))
            .unwrap_or_default();
        println!("  {}: {}{}", table, value, version);
    }

    let partial = state.partial_progress();
    if !partial.is_empty() {
        println!();
        println!("Partial progress (interrupted runs):");
        for (table, progress) in &partial {
            println!(
                "  {}: {} rows, last id {} at {}",
                table, progress.rows_processed, progress.last_row_id, progress.timestamp
            );
        }
    }
    Ok(())
}

/// State files are only written while the sync lock is held.
fn restore_checkpoint(config: &SyncConfig, file: &std::path::Path) -> anyhow::Result<()> {
    let checkpoint = Checkpoint::load(file)?;
    let lock = SyncLock::new(config.state.lock_file.clone(), config.state.lock_stale_after());
    if !lock.acquire(config.state.lock_timeout())? {
        anyhow::bail!(
            "Another sync holds {}; cannot restore while it runs",
            lock.path().display()
        );
    }

    let result = StateStore::new(&config.state).rollback(&checkpoint);
    lock.release();
    result?;

    println!(
        "✓ Restored {} watermark(s) from {}",
        checkpoint.watermarks.len(),
        file.display()
    );
    Ok(())
}
