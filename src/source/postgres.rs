// ABOUTME: PostgresSource - reads source tables through a server-side cursor
// ABOUTME: Converts tokio-postgres rows into ordered JSON values

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;
use tokio_postgres::{Client, Row as PgRow};

use super::{ExtractRequest, Row, SourceAdapter};
use crate::timestamp;
use crate::type_mapper::ColumnSchema;
use crate::utils::{quote_ident, quote_literal};

const CURSOR_NAME: &str = "columnar_sync_cursor";

/// Extracts rows from PostgreSQL.
///
/// Each extraction runs inside a REPEATABLE READ, READ ONLY transaction so
/// every batch sees the same snapshot, and pages through a NO SCROLL cursor
/// with `FETCH FORWARD n`.
pub struct PostgresSource {
    client: Client,
    /// Data types of the columns in the open extraction, in select order.
    column_types: Vec<String>,
    cursor_open: bool,
}

impl PostgresSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            column_types: Vec::new(),
            cursor_open: false,
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = crate::postgres::connect_with_retry(url)
            .await
            .context("Failed to connect to source database")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl SourceAdapter for PostgresSource {
    async fn table_schema(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnSchema>> {
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}.{}", schema, table))?;

        Ok(rows
            .iter()
            .map(|row| ColumnSchema::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn primary_key(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}.{}", schema, table))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn open_extract(&mut self, request: &ExtractRequest) -> Result<()> {
        if self.cursor_open {
            self.close_extract().await?;
        }

        let schema = self.table_schema(&request.schema, &request.table).await?;
        let mut selected = Vec::with_capacity(request.columns.len());
        for name in &request.columns {
            let col = schema
                .iter()
                .find(|c| &c.name == name)
                .with_context(|| {
                    format!(
                        "Column {} not found in {}",
                        name,
                        request.qualified_table()
                    )
                })?;
            selected.push(col.clone());
        }

        let query = build_extract_query(request, &selected);
        tracing::debug!("Opening cursor: {}", query);

        self.client
            .batch_execute(&format!(
                "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY; \
                 SET LOCAL TIME ZONE 'UTC'; \
                 DECLARE {} NO SCROLL CURSOR FOR {}",
                CURSOR_NAME, query
            ))
            .await
            .with_context(|| {
                format!("Failed to open cursor on {}", request.qualified_table())
            })?;

        self.column_types = selected.into_iter().map(|c| c.data_type).collect();
        self.cursor_open = true;
        Ok(())
    }

    async fn fetch_batch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        if !self.cursor_open {
            anyhow::bail!("fetch_batch called without an open extraction");
        }
        if max_rows == 0 {
            return Ok(Vec::new());
        }

        let rows = self
            .client
            .query(
                &format!("FETCH FORWARD {} FROM {}", max_rows, CURSOR_NAME),
                &[],
            )
            .await
            .context("Failed to fetch batch from source cursor")?;

        rows.iter()
            .map(|row| row_to_json(row, &self.column_types))
            .collect()
    }

    async fn close_extract(&mut self) -> Result<()> {
        if !self.cursor_open {
            return Ok(());
        }
        self.cursor_open = false;
        self.column_types.clear();
        // Read-only transaction: rollback ends the snapshot and drops the cursor,
        // and also works when a failed fetch aborted the transaction.
        self.client
            .batch_execute("ROLLBACK")
            .await
            .context("Failed to close source cursor")
    }
}

/// Types read natively; everything else is cast to text in the select list.
fn is_native_type(data_type: &str) -> bool {
    matches!(
        data_type,
        "smallint"
            | "integer"
            | "bigint"
            | "real"
            | "double precision"
            | "numeric"
            | "boolean"
            | "text"
            | "character varying"
            | "character"
            | "name"
            | "uuid"
            | "date"
            | "timestamp without time zone"
            | "timestamp with time zone"
            | "json"
            | "jsonb"
            | "bytea"
    )
}

/// Build the cursor query for an extraction.
///
/// Generates a query like:
/// ```sql
/// SELECT "id", "payload"::text AS "payload", "updated_at"
/// FROM "public"."events"
/// WHERE "updated_at" > '2024-01-01T00:00:00'
/// ORDER BY "updated_at"
/// ```
fn build_extract_query(request: &ExtractRequest, columns: &[ColumnSchema]) -> String {
    let select_list = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| {
                let ident = quote_ident(&c.name);
                if is_native_type(&c.data_type) {
                    ident
                } else {
                    format!("{}::text AS {}", ident, ident)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut query = format!(
        "SELECT {} FROM {}.{}",
        select_list,
        quote_ident(&request.schema),
        quote_ident(&request.table)
    );

    if let Some(bound) = &request.lower_bound {
        let data_type = columns
            .iter()
            .find(|c| c.name == bound.column)
            .map(|c| c.data_type.as_str());
        query.push_str(&format!(
            " WHERE {} > {}",
            quote_ident(&bound.column),
            bound_literal(&bound.value, data_type)
        ));
    }

    if !request.order_by.is_empty() {
        let order: Vec<String> = request.order_by.iter().map(|c| quote_ident(c)).collect();
        query.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }

    query
}

/// Watermarks are naive UTC; timestamptz bounds carry the offset so the
/// session TimeZone cannot shift them.
fn bound_literal(value: &str, data_type: Option<&str>) -> String {
    if data_type == Some("timestamp with time zone") {
        if let Some(ts) = timestamp::parse_timestamp(value) {
            let utc = format!("{}+00:00", timestamp::format_naive(&ts));
            return format!("{}::timestamptz", quote_literal(&utc));
        }
    }
    quote_literal(value)
}

fn float_value(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Convert a tokio_postgres Row to ordered JSON values.
///
/// Timestamps become ISO-8601 strings, numerics and uuids strings, bytea base64.
pub fn row_to_json(row: &PgRow, column_types: &[String]) -> Result<Row> {
    column_types
        .iter()
        .enumerate()
        .map(|(idx, dtype)| -> Result<Value> {
            let value = match dtype.as_str() {
                "smallint" => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
                "integer" => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
                "bigint" => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
                "real" => Some(float_value(
                    row.try_get::<_, Option<f32>>(idx)?.map(|v| v as f64),
                )),
                "double precision" => Some(float_value(row.try_get::<_, Option<f64>>(idx)?)),
                "numeric" => row
                    .try_get::<_, Option<rust_decimal::Decimal>>(idx)
                    .unwrap_or_else(|e| {
                        // NaN and out-of-range values have no Decimal form
                        tracing::warn!("Unreadable numeric in column {}: {}", idx, e);
                        None
                    })
                    .map(|d| Value::String(d.to_string())),
                "boolean" => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
                "uuid" => row
                    .try_get::<_, Option<uuid::Uuid>>(idx)?
                    .map(|u| Value::String(u.to_string())),
                "date" => row
                    .try_get::<_, Option<chrono::NaiveDate>>(idx)?
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
                "timestamp without time zone" => row
                    .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
                    .map(|ts| Value::String(timestamp::format_naive(&ts))),
                "timestamp with time zone" => row
                    .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
                    .map(|ts| Value::String(timestamp::format_utc(&ts))),
                "json" | "jsonb" => row.try_get::<_, Option<Value>>(idx)?,
                "bytea" => row
                    .try_get::<_, Option<Vec<u8>>>(idx)?
                    .map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b))),
                // Text types, plus everything cast to text by build_extract_query
                _ => row.try_get::<_, Option<String>>(idx)?.map(Value::String),
            };
            Ok(value.unwrap_or(Value::Null))
        })
        .collect::<Result<Row>>()
        .context("Failed to convert source row")
}
