// ABOUTME: In-process SinkAdapter with inspectable tables and failure injection
// ABOUTME: Clones share the same tables so callers can observe what a worker wrote

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::SinkAdapter;
use crate::source::Row;
use crate::timestamp;
use crate::type_mapper::SinkColumnSchema;

#[derive(Debug, Clone, Default)]
pub struct MemorySinkTable {
    pub columns: Vec<SinkColumnSchema>,
    pub primary_key: Option<Vec<String>>,
    pub rows: Vec<Row>,
    /// Row count of every successful insert_batch call, in order.
    pub batches: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    tables: Arc<Mutex<HashMap<String, MemorySinkTable>>>,
    failing_inserts: Arc<AtomicU32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` insert_batch calls fail.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn table(&self, table: &str) -> Option<MemorySinkTable> {
        self.lock().get(table).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemorySinkTable>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SinkAdapter for MemorySink {
    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.lock().contains_key(table))
    }

    async fn create_table(
        &mut self,
        table: &str,
        columns: &[SinkColumnSchema],
        primary_key: Option<&[String]>,
    ) -> Result<()> {
        self.lock()
            .entry(table.to_string())
            .or_insert_with(|| MemorySinkTable {
                columns: columns.to_vec(),
                primary_key: primary_key.filter(|pk| !pk.is_empty()).map(|pk| pk.to_vec()),
                rows: Vec::new(),
                batches: Vec::new(),
            });
        Ok(())
    }

    async fn drop_table(&mut self, table: &str) -> Result<()> {
        self.lock().remove(table);
        Ok(())
    }

    async fn insert_batch(
        &mut self,
        table: &str,
        columns: &[SinkColumnSchema],
        rows: &[Row],
    ) -> Result<u64> {
        let remaining = self.failing_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_inserts.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("injected insert failure into {}", table);
        }

        let mut tables = self.lock();
        let data = tables
            .get_mut(table)
            .with_context(|| format!("Table {} does not exist", table))?;
        if columns.len() != data.columns.len() {
            anyhow::bail!(
                "Insert into {} has {} columns, table has {}",
                table,
                columns.len(),
                data.columns.len()
            );
        }
        if let Some(bad) = rows.iter().position(|r| r.len() != columns.len()) {
            anyhow::bail!("Row {} width does not match {} columns", bad, columns.len());
        }
        data.rows.extend_from_slice(rows);
        data.batches.push(rows.len());
        Ok(rows.len() as u64)
    }

    async fn max_value(&mut self, table: &str, column: &str) -> Result<Option<String>> {
        let tables = self.lock();
        let data = tables
            .get(table)
            .with_context(|| format!("Table {} does not exist", table))?;
        let idx = data
            .columns
            .iter()
            .position(|c| c.name == column)
            .with_context(|| format!("Column {} not found in {}", column, table))?;

        let max = data
            .rows
            .iter()
            .filter_map(|row| match &row[idx] {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .reduce(|best, next| {
                if timestamp::is_after(&next, &best) {
                    next
                } else {
                    best
                }
            });
        Ok(max)
    }

    async fn row_count(&mut self, table: &str) -> Result<u64> {
        Ok(self
            .lock()
            .get(table)
            .map(|t| t.rows.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns() -> Vec<SinkColumnSchema> {
        vec![
            SinkColumnSchema {
                name: "id".into(),
                sink_type: "Int64".into(),
                nullable: false,
            },
            SinkColumnSchema {
                name: "ts".into(),
                sink_type: "DateTime64(6)".into(),
                nullable: true,
            },
        ]
    }

    #[tokio::test]
    async fn test_insert_and_max() {
        let mut sink = MemorySink::new();
        sink.create_table("t", &columns(), Some(&["id".to_string()]))
            .await
            .unwrap();
        sink.insert_batch(
            "t",
            &columns(),
            &[
                vec![json!(1), json!("2024-01-02T00:00:00")],
                vec![json!(2), Value::Null],
                vec![json!(3), json!("2024-01-01T00:00:00")],
            ],
        )
        .await
        .unwrap();

        assert_eq!(
            sink.max_value("t", "ts").await.unwrap().as_deref(),
            Some("2024-01-02T00:00:00")
        );
        assert_eq!(sink.row_count("t").await.unwrap(), 3);
        assert_eq!(sink.table("t").unwrap().batches, vec![3]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let mut sink = MemorySink::new();
        sink.create_table("t", &columns(), None).await.unwrap();
        sink.fail_next_inserts(1);

        let row = vec![vec![json!(1), Value::Null]];
        assert!(sink.insert_batch("t", &columns(), &row).await.is_err());
        assert_eq!(sink.insert_batch("t", &columns(), &row).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_table_has_no_max() {
        let mut sink = MemorySink::new();
        sink.create_table("t", &columns(), None).await.unwrap();
        assert_eq!(sink.max_value("t", "ts").await.unwrap(), None);
        assert!(sink.max_value("missing", "ts").await.is_err());
    }
}
