// ABOUTME: File-backed JSON state - watermarks, schema mapping versions, partial progress
// ABOUTME: Corrupt or missing files read as empty; writes go through temp file + rename

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::StateConfig;
use crate::timestamp;
use crate::type_mapper::{ColumnSchema, SinkColumnSchema};

/// Watermarks keyed by sink table.
pub type WatermarkMap = BTreeMap<String, String>;

/// Snapshot of every watermark, taken before a risky operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub watermarks: WatermarkMap,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Load a checkpoint previously written with [`Checkpoint::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint from {:?}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse checkpoint from {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

/// Advisory resumption hint for a table; never consumed automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialProgress {
    pub rows_processed: u64,
    pub last_row_id: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedColumn {
    pub name: String,
    pub source_type: String,
    pub sink_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedSchema {
    /// SHA-256 over column names and types; a new version is recorded when it changes.
    pub fingerprint: String,
    pub columns: Vec<MappedColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub schema: MappedSchema,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableMappings {
    pub latest_version: u32,
    pub versions: BTreeMap<u32, SchemaVersion>,
}

/// Persists sync state in three JSON files.
///
/// No file-level locking is done here: callers must hold the
/// [`SyncLock`](crate::lock::SyncLock) while mutating state.
#[derive(Debug, Clone)]
pub struct StateStore {
    watermark_file: PathBuf,
    schema_mapping_file: PathBuf,
    partial_progress_file: PathBuf,
}

impl StateStore {
    pub fn new(config: &StateConfig) -> Self {
        Self {
            watermark_file: config.watermark_file.clone(),
            schema_mapping_file: config.schema_mapping_file.clone(),
            partial_progress_file: config.partial_progress_file.clone(),
        }
    }

    /// All persisted watermarks; empty when the file is missing or corrupt.
    pub fn watermarks(&self) -> WatermarkMap {
        read_json_or_default(&self.watermark_file)
    }

    pub fn get_watermark(&self, sink_table: &str) -> Option<String> {
        self.watermarks().remove(sink_table)
    }

    /// Store `value` as the watermark for `sink_table` unless that would move it backwards.
    ///
    /// Returns whether the stored watermark changed.
    pub fn commit_watermark(&self, sink_table: &str, value: &str) -> Result<bool> {
        let value = timestamp::normalize(value);
        let mut watermarks = self.watermarks();
        if let Some(current) = watermarks.get(sink_table) {
            if !timestamp::is_after(&value, current) {
                tracing::debug!(
                    "Keeping watermark for {} at {} (candidate {})",
                    sink_table,
                    current,
                    value
                );
                return Ok(false);
            }
        }
        watermarks.insert(sink_table.to_string(), value);
        write_json_atomic(&self.watermark_file, &watermarks)?;
        Ok(true)
    }

    /// Drop the watermark for `sink_table` so the next run starts from scratch.
    pub fn remove_watermark(&self, sink_table: &str) -> Result<Option<String>> {
        let mut watermarks = self.watermarks();
        let removed = watermarks.remove(sink_table);
        if removed.is_some() {
            write_json_atomic(&self.watermark_file, &watermarks)?;
        }
        Ok(removed)
    }

    pub fn create_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            watermarks: self.watermarks(),
            created_at: Utc::now(),
        }
    }

    /// Overwrite persisted watermarks with the checkpoint's snapshot.
    pub fn rollback(&self, checkpoint: &Checkpoint) -> Result<()> {
        tracing::info!(
            "Rolling back watermarks to checkpoint from {} ({} tables)",
            checkpoint.created_at,
            checkpoint.watermarks.len()
        );
        write_json_atomic(&self.watermark_file, &checkpoint.watermarks)
    }

    /// Record the mapping used for a run, bumping the version only when it changed.
    ///
    /// Returns the version now considered latest.
    pub fn record_schema_mapping(
        &self,
        table: &str,
        source: &[ColumnSchema],
        sink: &[SinkColumnSchema],
    ) -> Result<u32> {
        let schema = mapped_schema(source, sink);
        let mut mappings: BTreeMap<String, TableMappings> =
            read_json_or_default(&self.schema_mapping_file);
        let entry = mappings.entry(table.to_string()).or_default();

        let unchanged = entry
            .versions
            .get(&entry.latest_version)
            .map(|v| v.schema.fingerprint == schema.fingerprint)
            .unwrap_or(false);
        if unchanged {
            return Ok(entry.latest_version);
        }

        let version = entry.latest_version + 1;
        entry.versions.insert(
            version,
            SchemaVersion {
                schema,
                timestamp: Utc::now(),
            },
        );
        entry.latest_version = version;
        tracing::info!("Recorded schema mapping version {} for {}", version, table);

        write_json_atomic(&self.schema_mapping_file, &mappings)?;
        Ok(version)
    }

    pub fn latest_schema_mapping(&self, table: &str) -> Option<(u32, SchemaVersion)> {
        let mut mappings: BTreeMap<String, TableMappings> =
            read_json_or_default(&self.schema_mapping_file);
        let entry = mappings.remove(table)?;
        let latest = entry.latest_version;
        entry.versions.get(&latest).cloned().map(|v| (latest, v))
    }

    pub fn save_partial_progress(
        &self,
        table: &str,
        rows_processed: u64,
        last_row_id: i64,
    ) -> Result<()> {
        let mut progress = self.partial_progress();
        progress.insert(
            table.to_string(),
            PartialProgress {
                rows_processed,
                last_row_id,
                timestamp: Utc::now(),
            },
        );
        write_json_atomic(&self.partial_progress_file, &progress)
    }

    pub fn load_partial_progress(&self, table: &str) -> Option<PartialProgress> {
        self.partial_progress().remove(table)
    }

    pub fn partial_progress(&self) -> BTreeMap<String, PartialProgress> {
        read_json_or_default(&self.partial_progress_file)
    }

    pub fn clear_partial_progress(&self, table: &str) -> Result<()> {
        let mut progress = self.partial_progress();
        if progress.remove(table).is_some() {
            write_json_atomic(&self.partial_progress_file, &progress)?;
        }
        Ok(())
    }
}

fn mapped_schema(source: &[ColumnSchema], sink: &[SinkColumnSchema]) -> MappedSchema {
    let columns: Vec<MappedColumn> = source
        .iter()
        .zip(sink)
        .map(|(src, dst)| MappedColumn {
            name: src.name.clone(),
            source_type: src.data_type.clone(),
            sink_type: dst.sink_type.clone(),
            nullable: dst.nullable,
        })
        .collect();

    let mut hasher = Sha256::new();
    for col in &columns {
        hasher.update(col.name.as_bytes());
        hasher.update([0]);
        hasher.update(col.source_type.as_bytes());
        hasher.update([0]);
        hasher.update(col.sink_type.as_bytes());
        hasher.update([col.nullable as u8]);
    }
    let fingerprint = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    MappedSchema {
        fingerprint,
        columns,
    }
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!("Failed to read state file {:?}: {}. Using defaults.", path, e);
            return T::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Corrupt state file {:?}: {}. Using defaults.", path, e);
            T::default()
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create directory {:?}", dir))?;

    let contents = serde_json::to_string_pretty(value).context("Failed to serialize state")?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write state for {:?}", path))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace state file {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_mapper::map_schema;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(&StateConfig::in_dir(dir.path()));
        (dir, store)
    }

    #[test]
    fn test_missing_files_read_as_empty() {
        let (_dir, store) = store();
        assert!(store.watermarks().is_empty());
        assert!(store.get_watermark("events").is_none());
        assert!(store.load_partial_progress("events").is_none());
        assert!(store.latest_schema_mapping("events").is_none());
    }

    #[test]
    fn test_commit_watermark_never_decreases() {
        let (_dir, store) = store();
        assert!(store.commit_watermark("events", "2024-01-02 00:00:00").unwrap());
        assert_eq!(
            store.get_watermark("events").as_deref(),
            Some("2024-01-02T00:00:00")
        );

        assert!(!store.commit_watermark("events", "2024-01-01T00:00:00").unwrap());
        assert!(!store.commit_watermark("events", "2024-01-02T00:00:00").unwrap());
        assert_eq!(
            store.get_watermark("events").as_deref(),
            Some("2024-01-02T00:00:00")
        );

        assert!(store.commit_watermark("events", "2024-01-03T00:00:00").unwrap());
        assert_eq!(
            store.get_watermark("events").as_deref(),
            Some("2024-01-03T00:00:00")
        );
    }

    #[test]
    fn test_corrupt_watermark_file_falls_back() {
        let (dir, store) = store();
        fs::write(dir.path().join("watermarks.json"), "{not json").unwrap();
        assert!(store.watermarks().is_empty());

        // Writing recovers the file
        store.commit_watermark("events", "2024-01-01T00:00:00").unwrap();
        assert_eq!(store.watermarks().len(), 1);
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let (_dir, store) = store();
        store.commit_watermark("a", "2024-01-01T00:00:00").unwrap();
        let checkpoint = store.create_checkpoint();

        store.commit_watermark("a", "2024-06-01T00:00:00").unwrap();
        store.commit_watermark("b", "2024-06-01T00:00:00").unwrap();

        store.rollback(&checkpoint).unwrap();
        assert_eq!(store.watermarks(), checkpoint.watermarks);
        assert!(store.get_watermark("b").is_none());
    }

    #[test]
    fn test_schema_mapping_versions_only_on_change() {
        let (_dir, store) = store();
        let pk = vec!["id".to_string()];
        let v1 = vec![ColumnSchema::new("id", "bigint"), ColumnSchema::new("name", "text")];
        let v1_sink = map_schema(&v1, &pk);

        assert_eq!(store.record_schema_mapping("users", &v1, &v1_sink).unwrap(), 1);
        assert_eq!(store.record_schema_mapping("users", &v1, &v1_sink).unwrap(), 1);

        let mut v2 = v1.clone();
        v2.push(ColumnSchema::new("email", "text"));
        let v2_sink = map_schema(&v2, &pk);
        assert_eq!(store.record_schema_mapping("users", &v2, &v2_sink).unwrap(), 2);

        let (version, latest) = store.latest_schema_mapping("users").unwrap();
        assert_eq!(version, 2);
        assert_eq!(latest.schema.columns.len(), 3);
        assert_eq!(latest.schema.columns[2].sink_type, "String");
    }

    #[test]
    fn test_schema_mapping_file_layout() {
        let (dir, store) = store();
        let cols = vec![ColumnSchema::new("id", "integer")];
        store
            .record_schema_mapping("users", &cols, &map_schema(&cols, &[]))
            .unwrap();

        let raw: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("schema_mappings.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["users"]["latest_version"], 1);
        assert!(raw["users"]["versions"]["1"]["schema"].is_object());
        assert!(raw["users"]["versions"]["1"]["timestamp"].is_string());
    }

    #[test]
    fn test_partial_progress_roundtrip() {
        let (_dir, store) = store();
        store.save_partial_progress("events", 20_000, 19_999).unwrap();
        store.save_partial_progress("other", 5, 5).unwrap();

        let progress = store.load_partial_progress("events").unwrap();
        assert_eq!(progress.rows_processed, 20_000);
        assert_eq!(progress.last_row_id, 19_999);

        store.clear_partial_progress("events").unwrap();
        assert!(store.load_partial_progress("events").is_none());
        assert!(store.load_partial_progress("other").is_some());
    }

    #[test]
    fn test_checkpoint_file_roundtrip() {
        let (dir, store) = store();
        store.commit_watermark("a", "2024-01-01T00:00:00").unwrap();
        let path = dir.path().join("cp.json");
        let checkpoint = store.create_checkpoint();
        checkpoint.save(&path).unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap(), checkpoint);
    }
}
