// ABOUTME: SourceAdapter trait - schema introspection and cursor-based batch extraction
// ABOUTME: Rows are ordered JSON values with timestamps normalized to ISO-8601 strings

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;

use crate::type_mapper::ColumnSchema;

pub use memory::{MemorySource, MemoryTable};
pub use postgres::PostgresSource;

/// One extracted row; values line up with the requested columns.
pub type Row = Vec<serde_json::Value>;

/// What to extract and in which order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    /// Only rows with `column > value` are returned.
    pub lower_bound: Option<Watermark>,
    /// Deterministic extraction order; incremental runs order by the time column.
    pub order_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub column: String,
    pub value: String,
}

impl ExtractRequest {
    pub fn full(schema: &str, table: &str, columns: Vec<String>, order_by: Vec<String>) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
            lower_bound: None,
            order_by,
        }
    }

    pub fn after(mut self, column: &str, value: &str) -> Self {
        self.lower_bound = Some(Watermark {
            column: column.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Paginated, cursor-based reads from the transactional source.
///
/// One extraction is open at a time per adapter. Instances are not shared
/// across concurrent syncs.
#[async_trait]
pub trait SourceAdapter: Send {
    /// Ordered columns of `schema.table`; empty when the table does not exist.
    async fn table_schema(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnSchema>>;

    /// Primary key columns of `schema.table` in key order.
    async fn primary_key(&mut self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Start an extraction; replaces any extraction already open.
    async fn open_extract(&mut self, request: &ExtractRequest) -> Result<()>;

    /// Next page of at most `max_rows` rows. Fewer rows than requested means end of data.
    async fn fetch_batch(&mut self, max_rows: usize) -> Result<Vec<Row>>;

    /// Release cursor resources. Safe to call when nothing is open.
    async fn close_extract(&mut self) -> Result<()>;
}
