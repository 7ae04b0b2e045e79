// ABOUTME: In-process SourceAdapter over shared tables
// ABOUTME: Backs tests and embedded use without a PostgreSQL server

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ExtractRequest, Row, SourceAdapter};
use crate::timestamp;
use crate::type_mapper::ColumnSchema;

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    pub fn new(columns: Vec<ColumnSchema>, primary_key: Vec<String>) -> Self {
        Self {
            columns,
            primary_key,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }
}

/// Source whose tables live in memory.
///
/// Clones share table data; each clone has its own extraction cursor.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    tables: Arc<Mutex<HashMap<String, MemoryTable>>>,
    pending: Option<VecDeque<Row>>,
    fetch_delay: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, schema: &str, table: &str, data: MemoryTable) {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key(schema, table), data);
    }

    /// Sleep before every batch, simulating a slow source.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Append rows to an existing table.
    pub fn insert_rows(&self, schema: &str, table: &str, rows: Vec<Row>) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let data = tables
            .get_mut(&key(schema, table))
            .with_context(|| format!("Unknown table {}.{}", schema, table))?;
        data.rows.extend(rows);
        Ok(())
    }

    /// A handle sharing this source's tables with no extraction open.
    pub fn fresh(&self) -> Self {
        Self {
            tables: Arc::clone(&self.tables),
            pending: None,
            fetch_delay: self.fetch_delay,
        }
    }

    fn table(&self, schema: &str, table: &str) -> Option<MemoryTable> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(schema, table))
            .cloned()
    }
}

fn key(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

/// Order JSON values the way the source database would order the column.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        // NULLS LAST, as PostgreSQL does for ascending order
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => {
            match (timestamp::parse_timestamp(x), timestamp::parse_timestamp(y)) {
                (Some(tx), Some(ty)) => tx.cmp(&ty),
                _ => x.cmp(y),
            }
        }
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[async_trait]
impl SourceAdapter for MemorySource {
    async fn table_schema(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnSchema>> {
        Ok(self
            .table(schema, table)
            .map(|t| t.columns)
            .unwrap_or_default())
    }

    async fn primary_key(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        Ok(self
            .table(schema, table)
            .map(|t| t.primary_key)
            .unwrap_or_default())
    }

    async fn open_extract(&mut self, request: &ExtractRequest) -> Result<()> {
        let data = self
            .table(&request.schema, &request.table)
            .with_context(|| format!("Unknown table {}", request.qualified_table()))?;
        // Every index below is a column position, so rows must be full width
        if let Some((pos, row)) = data
            .rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != data.columns.len())
        {
            anyhow::bail!(
                "Row {} of {} has {} values for {} columns",
                pos,
                request.qualified_table(),
                row.len(),
                data.columns.len()
            );
        }

        let index_of = |name: &str| -> Result<usize> {
            data.columns
                .iter()
                .position(|c| c.name == name)
                .with_context(|| format!("Column {} not found in {}", name, request.qualified_table()))
        };

        let projection: Vec<usize> = request
            .columns
            .iter()
            .map(|c| index_of(c.as_str()))
            .collect::<Result<_>>()?;
        let bound = match &request.lower_bound {
            Some(w) => Some((index_of(w.column.as_str())?, Value::String(w.value.clone()))),
            None => None,
        };
        let order: Vec<usize> = request
            .order_by
            .iter()
            .map(|c| index_of(c.as_str()))
            .collect::<Result<_>>()?;

        let mut rows: Vec<&Row> = data
            .rows
            .iter()
            .filter(|row| match &bound {
                Some((idx, value)) => {
                    !row[*idx].is_null() && compare_values(&row[*idx], value) == Ordering::Greater
                }
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| {
            order
                .iter()
                .map(|&i| compare_values(&a[i], &b[i]))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        self.pending = Some(
            rows.into_iter()
                .map(|row| projection.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        );
        Ok(())
    }

    async fn fetch_batch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let pending = self
            .pending
            .as_mut()
            .context("fetch_batch called without an open extraction")?;
        let take = max_rows.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn close_extract(&mut self) -> Result<()> {
        self.pending = None;
        Ok(())
    }
}
