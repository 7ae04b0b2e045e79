// ABOUTME: CLI tests for status, checkpoint save/restore and unlock
// ABOUTME: Runs the binary against an isolated state directory

use columnar_sync::config::StateConfig;
use columnar_sync::lock::SyncLock;
use columnar_sync::state::{Checkpoint, StateStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

/// Write a config placing every state file under `dir`.
fn write_config(dir: &Path) -> PathBuf {
    let state = dir.join("state");
    let config = format!(
        r#"
[state]
watermark_file = '{wm}'
schema_mapping_file = '{sm}'
partial_progress_file = '{pp}'
lock_file = '{lock}'
lock_timeout_secs = 0
"#,
        wm = state.join("watermarks.json").display(),
        sm = state.join("schema_mappings.json").display(),
        pp = state.join("partial_progress.json").display(),
        lock = state.join("sync.lock").display(),
    );
    let path = dir.join("columnar-sync.toml");
    fs::write(&path, config).unwrap();
    path
}

fn state_config(dir: &Path) -> StateConfig {
    StateConfig::in_dir(dir.join("state"))
}

fn run(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_columnar-sync"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("COLUMNAR_SYNC_SOURCE_URL")
        .env_remove("COLUMNAR_SYNC_SINK_URL")
        .output()
        .expect("Failed to execute command")
}

fn setup() -> (TempDir, PathBuf, StateStore) {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let store = StateStore::new(&state_config(dir.path()));
    (dir, config, store)
}

#[test]
fn test_status_on_empty_state() {
    let (_dir, config, _store) = setup();

    let output = run(&config, &["status"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Lock:      free"));
    assert!(stdout.contains("(none)"));
}

#[test]
fn test_status_lists_watermarks_and_partial_progress() {
    let (_dir, config, store) = setup();
    store.commit_watermark("events", "2024-05-01 10:00:00").unwrap();
    store.save_partial_progress("orders", 20_000, 20_000).unwrap();

    let output = run(&config, &["status"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("events: 2024-05-01T10:00:00"));
    assert!(stdout.contains("orders: 20000 rows, last id 20000"));
}

#[test]
fn test_status_tolerates_corrupt_state() {
    let (dir, config, store) = setup();
    let watermark_file = state_config(dir.path()).watermark_file;
    fs::create_dir_all(watermark_file.parent().unwrap()).unwrap();
    fs::write(&watermark_file, "{ definitely not json").unwrap();

    let output = run(&config, &["status"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("(none)"));

    // A later commit replaces the corrupt file
    assert!(store.commit_watermark("events", "2024-01-01T00:00:00").unwrap());
    assert_eq!(store.watermarks().len(), 1);
}

#[test]
fn test_checkpoint_save_and_restore() {
    let (dir, config, store) = setup();
    store.commit_watermark("events", "2024-01-01T00:00:00").unwrap();
    store.commit_watermark("orders", "2024-02-01T00:00:00").unwrap();
    let before = store.watermarks();

    let checkpoint_file = dir.path().join("checkpoint.json");
    let output = run(&config, &["checkpoint", "save", checkpoint_file.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Saved 2 watermark(s)"));
    assert_eq!(Checkpoint::load(&checkpoint_file).unwrap().watermarks, before);

    store.commit_watermark("events", "2024-03-01T00:00:00").unwrap();
    store.commit_watermark("users", "2024-03-01T00:00:00").unwrap();

    let output = run(&config, &["checkpoint", "restore", checkpoint_file.to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(store.watermarks(), before);

    // Restoring releases the lock it took
    let lock = SyncLock::new(state_config(dir.path()).lock_file, Duration::from_secs(3600));
    assert!(!lock.is_locked());
}

#[test]
fn test_restore_refused_while_locked_and_unlock() {
    let (dir, config, store) = setup();
    store.commit_watermark("events", "2024-01-01T00:00:00").unwrap();
    let checkpoint_file = dir.path().join("checkpoint.json");
    store.create_checkpoint().save(&checkpoint_file).unwrap();
    store.commit_watermark("events", "2024-06-01T00:00:00").unwrap();

    let lock = SyncLock::new(state_config(dir.path()).lock_file, Duration::from_secs(3600));
    assert!(lock.acquire(Duration::ZERO).unwrap());

    let output = run(&config, &["status"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("held by pid"));

    let output = run(&config, &["checkpoint", "restore", checkpoint_file.to_str().unwrap()]);
    assert!(!output.status.success());
    assert_eq!(
        store.get_watermark("events").as_deref(),
        Some("2024-06-01T00:00:00")
    );

    let output = run(&config, &["unlock"]);
    assert!(output.status.success());
    assert!(!lock.is_locked());
}

#[test]
fn test_incremental_without_watermark_fails_fast() {
    let (_dir, config, _store) = setup();

    let output = run(
        &config,
        &["sync", "incremental", "--table", "events", "--time-column", "updated_at"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No stored watermark for events"), "{}", stderr);
}
