// ABOUTME: ClickHouseSink - writes batches to ClickHouse over its HTTP interface
// ABOUTME: Generates MergeTree DDL from the mapped schema and inserts JSONEachRow bodies

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use std::time::Duration;

use super::SinkAdapter;
use crate::config::SinkConfig;
use crate::source::Row;
use crate::type_mapper::SinkColumnSchema;
use crate::utils::quote_backtick_ident as quote;

/// Bulk writer for a ClickHouse database.
pub struct ClickHouseSink {
    client: Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .context("sink.url is not configured")?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn table_ref(&self, table: &str) -> String {
        format!("{}.{}", quote(&self.database), quote(table))
    }

    /// Run a statement. With `data`, the statement goes in the URL and `data` is the body.
    async fn execute(&self, statement: &str, data: Option<String>) -> Result<String> {
        let mut request = self.client.post(format!("{}/", self.url)).query(&[
            ("database", self.database.as_str()),
            ("date_time_input_format", "best_effort"),
        ]);

        if let Some(ref user) = self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(ref password) = self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        request = match data {
            Some(body) => request.query(&[("query", statement)]).body(body),
            None => request.body(statement.to_string()),
        };

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach ClickHouse at {}", self.url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ClickHouse returned {}: {}", status, body.trim());
        }

        response
            .text()
            .await
            .context("Failed to read ClickHouse response")
    }
}

#[async_trait]
impl SinkAdapter for ClickHouseSink {
    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let out = self
            .execute(&format!("EXISTS TABLE {}", self.table_ref(table)), None)
            .await
            .with_context(|| format!("Failed to check whether {} exists", table))?;
        Ok(out.trim() == "1")
    }

    async fn create_table(
        &mut self,
        table: &str,
        columns: &[SinkColumnSchema],
        primary_key: Option<&[String]>,
    ) -> Result<()> {
        let ddl = build_create_table(&self.database, table, columns, primary_key);
        tracing::debug!("Sink DDL: {}", ddl);
        self.execute(&ddl, None)
            .await
            .with_context(|| format!("Failed to create table {}", table))?;
        Ok(())
    }

    async fn drop_table(&mut self, table: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", self.table_ref(table)), None)
            .await
            .with_context(|| format!("Failed to drop table {}", table))?;
        Ok(())
    }

    async fn insert_batch(
        &mut self,
        table: &str,
        columns: &[SinkColumnSchema],
        rows: &[Row],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let statement = build_insert_query(&self.database, table, columns);
        let body = encode_rows(columns, rows)?;
        self.execute(&statement, Some(body))
            .await
            .with_context(|| format!("Failed to insert {} rows into {}", rows.len(), table))?;
        Ok(rows.len() as u64)
    }

    async fn max_value(&mut self, table: &str, column: &str) -> Result<Option<String>> {
        let query = format!(
            "SELECT toString(max({col})) AS value, count() AS rows \
             FROM {table} WHERE {col} IS NOT NULL FORMAT JSONEachRow",
            col = quote(column),
            table = self.table_ref(table)
        );
        let out = self
            .execute(&query, None)
            .await
            .with_context(|| format!("Failed to read max({}) from {}", column, table))?;
        parse_max_response(&out)
    }

    async fn row_count(&mut self, table: &str) -> Result<u64> {
        let query = format!(
            "SELECT count() AS rows FROM {} FORMAT JSONEachRow",
            self.table_ref(table)
        );
        let out = self
            .execute(&query, None)
            .await
            .with_context(|| format!("Failed to count rows in {}", table))?;
        let value: Value = serde_json::from_str(out.trim()).context("Invalid count response")?;
        json_u64(&value["rows"]).context("Count response missing rows")
    }
}

/// Build the DDL for a sink table.
///
/// Keyed tables:
/// ```sql
/// CREATE TABLE IF NOT EXISTS `db`.`events` (`id` Int64, `name` Nullable(String))
/// ENGINE = ReplacingMergeTree ORDER BY (`id`)
/// ```
/// Without a key the table is a plain `MergeTree ORDER BY tuple()`.
fn build_create_table(
    database: &str,
    table: &str,
    columns: &[SinkColumnSchema],
    primary_key: Option<&[String]>,
) -> String {
    let column_defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote(&c.name), c.ddl_type()))
        .collect();

    let engine = match primary_key {
        Some(pk) if !pk.is_empty() => {
            let keys: Vec<String> = pk.iter().map(|k| quote(k)).collect();
            format!("ReplacingMergeTree ORDER BY ({})", keys.join(", "))
        }
        _ => "MergeTree ORDER BY tuple()".to_string(),
    };

    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({}) ENGINE = {}",
        quote(database),
        quote(table),
        column_defs.join(", "),
        engine
    )
}

fn build_insert_query(database: &str, table: &str, columns: &[SinkColumnSchema]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote(&c.name)).collect();
    format!(
        "INSERT INTO {}.{} ({}) FORMAT JSONEachRow",
        quote(database),
        quote(table),
        names.join(", ")
    )
}

/// Newline-delimited JSON objects, one per row.
///
/// Non-string values bound for `String` columns (json, jsonb) are sent as their JSON text.
fn encode_rows(columns: &[SinkColumnSchema], rows: &[Row]) -> Result<String> {
    let mut body = String::new();
    for (i, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            anyhow::bail!(
                "Row {} has {} values but the sink schema has {} columns",
                i,
                row.len(),
                columns.len()
            );
        }
        let object: Map<String, Value> = columns
            .iter()
            .zip(row)
            .map(|(c, v)| (c.name.clone(), encode_value(c, v)))
            .collect();
        body.push_str(&serde_json::to_string(&object)?);
        body.push('\n');
    }
    Ok(body)
}

fn encode_value(column: &SinkColumnSchema, value: &Value) -> Value {
    match value {
        Value::Null | Value::String(_) => value.clone(),
        other if column.sink_type == "String" => Value::String(other.to_string()),
        other => other.clone(),
    }
}

/// ClickHouse quotes 64-bit integers in JSON output by default.
fn json_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_max_response(out: &str) -> Result<Option<String>> {
    let value: Value = serde_json::from_str(out.trim()).context("Invalid max() response")?;
    let rows = json_u64(&value["rows"]).context("max() response missing rows")?;
    if rows == 0 {
        return Ok(None);
    }
    Ok(value["value"].as_str().map(|s| s.to_string()))
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
                name: "name".into(),
                sink_type: "String".into(),
                nullable: true,
            },
        ]
    }

    #[test]
    fn test_create_table_with_key() {
        let ddl = build_create_table("analytics", "users", &columns(), Some(&["id".to_string()]));
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS `analytics`.`users` \
             (`id` Int64, `name` Nullable(String)) \
             ENGINE = ReplacingMergeTree ORDER BY (`id`)"
        );
    }

    #[test]
    fn test_create_table_without_key() {
        let ddl = build_create_table("analytics", "users_test", &columns(), None);
        assert!(ddl.ends_with("ENGINE = MergeTree ORDER BY tuple()"));

        let ddl = build_create_table("analytics", "users_test", &columns(), Some(&[]));
        assert!(ddl.ends_with("ENGINE = MergeTree ORDER BY tuple()"));
    }

    #[test]
    fn test_insert_query() {
        assert_eq!(
            build_insert_query("analytics", "users", &columns()),
            "INSERT INTO `analytics`.`users` (`id`, `name`) FORMAT JSONEachRow"
        );
    }

    #[test]
    fn test_encode_rows() {
        let body = encode_rows(
            &columns(),
            &[vec![json!(1), json!("a")], vec![json!(2), Value::Null]],
        )
        .unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": null})]);
    }

    #[test]
    fn test_encode_rows_stringifies_json_for_string_columns() {
        let body = encode_rows(
            &columns(),
            &[vec![json!(1), json!({"tags": ["a", "b"]})]],
        )
        .unwrap();
        let line: Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(line["id"], json!(1));
        assert_eq!(line["name"], json!("{\"tags\":[\"a\",\"b\"]}"));
    }

    #[test]
    fn test_encode_rows_rejects_width_mismatch() {
        assert!(encode_rows(&columns(), &[vec![json!(1)]]).is_err());
    }

    #[test]
    fn test_parse_max_response() {
        assert_eq!(
            parse_max_response("{\"value\":\"2024-01-02 03:04:05.000000\",\"rows\":\"7\"}\n").unwrap(),
            Some("2024-01-02 03:04:05.000000".to_string())
        );
        assert_eq!(parse_max_response("{\"value\":null,\"rows\":\"0\"}").unwrap(), None);
        assert_eq!(parse_max_response("{\"value\":\"1970-01-01 00:00:00.000000\",\"rows\":0}").unwrap(), None);
        assert!(parse_max_response("garbage").is_err());
    }

    #[test]
    fn test_new_requires_url() {
        assert!(ClickHouseSink::new(&SinkConfig::default()).is_err());
        let config = SinkConfig {
            url: Some("http://localhost:8123/".into()),
            ..SinkConfig::default()
        };
        let sink = ClickHouseSink::new(&config).unwrap();
        assert_eq!(sink.url, "http://localhost:8123");
        assert_eq!(sink.table_ref("t"), "`default`.`t`");
    }
}
