// ABOUTME: Configuration for sync runs - batch sizing, guards, retries, state paths
// ABOUTME: Loaded from TOML with every field defaulted; CLI flags override

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding state and lock files when no paths are configured.
pub const DEFAULT_STATE_DIR: &str = ".columnar-sync";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub sync: EngineConfig,
    pub state: StateConfig,
    pub defaults: TableDefaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// PostgreSQL connection string.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// ClickHouse HTTP endpoint, e.g. http://localhost:8123
    pub url: Option<String>,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            database: "default".to_string(),
            user: None,
            password: None,
            timeout_secs: 300,
        }
    }
}

/// Knobs for the batch loop and the incremental retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub max_duration_secs: u64,
    pub max_iterations: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub test_row_limit: u64,
    pub progress_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            max_duration_secs: 3600,
            max_iterations: 100_000,
            retry_attempts: 3,
            retry_delay_secs: 5,
            test_row_limit: 1000,
            progress_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub watermark_file: PathBuf,
    pub schema_mapping_file: PathBuf,
    pub partial_progress_file: PathBuf,
    pub lock_file: PathBuf,
    /// Age after which a lock file is considered abandoned.
    pub lock_stale_secs: u64,
    /// How long `start` waits for the lock before giving up.
    pub lock_timeout_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self::in_dir(DEFAULT_STATE_DIR)
    }
}

impl StateConfig {
    /// Place all state and lock files under one directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            watermark_file: dir.join("watermarks.json"),
            schema_mapping_file: dir.join("schema_mappings.json"),
            partial_progress_file: dir.join("partial_progress.json"),
            lock_file: dir.join("sync.lock"),
            lock_stale_secs: 3600,
            lock_timeout_secs: 5,
        }
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Table identifiers used when a sync request leaves them out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableDefaults {
    pub source_schema: String,
    pub source_table: Option<String>,
    pub sink_table: Option<String>,
    pub primary_key: Option<String>,
    pub time_column: Option<String>,
}

impl Default for TableDefaults {
    fn default() -> Self {
        Self {
            source_schema: "public".to_string(),
            source_table: None,
            sink_table: None,
            primary_key: None,
            time_column: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: SyncConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.batch_size == 0 {
            anyhow::bail!("sync.batch_size must be greater than 0");
        }
        if self.sync.max_iterations == 0 {
            anyhow::bail!("sync.max_iterations must be greater than 0");
        }
        if self.sync.progress_channel_capacity == 0 {
            anyhow::bail!("sync.progress_channel_capacity must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync.batch_size, 10_000);
        assert_eq!(config.sync.max_duration(), Duration::from_secs(3600));
        assert_eq!(config.sync.retry_attempts, 3);
        assert_eq!(config.sync.test_row_limit, 1000);
        assert_eq!(config.defaults.source_schema, "public");
        assert_eq!(config.sink.database, "default");
        assert!(config.state.lock_file.ends_with("sync.lock"));
        assert!(config.state.watermark_file.starts_with(DEFAULT_STATE_DIR));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [sync]
            batch_size = 500

            [defaults]
            source_table = "orders"
            time_column = "updated_at"
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.batch_size, 500);
        assert_eq!(config.sync.max_iterations, 100_000);
        assert_eq!(config.defaults.source_table.as_deref(), Some("orders"));
        assert_eq!(config.defaults.source_schema, "public");
        assert_eq!(config.state.lock_stale_secs, 3600);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(
            &path,
            "[sink]\nurl = \"http://localhost:8123\"\ndatabase = \"analytics\"\n",
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.sink.url.as_deref(), Some("http://localhost:8123"));
        assert_eq!(config.sink.database, "analytics");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "[sync]\nbatch_size = 0\n").unwrap();
        assert!(SyncConfig::load(&path).is_err());
    }

    #[test]
    fn test_state_in_dir() {
        let state = StateConfig::in_dir("/tmp/x");
        assert_eq!(state.watermark_file, PathBuf::from("/tmp/x/watermarks.json"));
        assert_eq!(state.lock_file, PathBuf::from("/tmp/x/sync.lock"));
    }
}
