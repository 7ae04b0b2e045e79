// ABOUTME: SinkAdapter trait - DDL, existence checks and bulk columnar writes
// ABOUTME: One insert_batch call is one bulk write of a whole extracted batch

pub mod clickhouse;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::source::Row;
use crate::type_mapper::SinkColumnSchema;

pub use clickhouse::ClickHouseSink;
pub use memory::{MemorySink, MemorySinkTable};

/// Destination side of a sync.
#[async_trait]
pub trait SinkAdapter: Send {
    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Create `table` if it does not exist.
    ///
    /// With a primary key the table deduplicates on that key
    /// (insert-or-replace); without one duplicates are kept.
    async fn create_table(
        &mut self,
        table: &str,
        columns: &[SinkColumnSchema],
        primary_key: Option<&[String]>,
    ) -> Result<()>;

    async fn drop_table(&mut self, table: &str) -> Result<()>;

    /// Write all `rows` in one bulk operation. Row values follow `columns` order.
    async fn insert_batch(
        &mut self,
        table: &str,
        columns: &[SinkColumnSchema],
        rows: &[Row],
    ) -> Result<u64>;

    /// `MAX(column)` as a string, or `None` when the table holds no non-NULL value.
    async fn max_value(&mut self, table: &str, column: &str) -> Result<Option<String>>;

    async fn row_count(&mut self, table: &str) -> Result<u64>;
}
