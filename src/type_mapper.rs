// ABOUTME: Maps PostgreSQL column types to ClickHouse column types
// ABOUTME: Pure lookup, no state; unknown types fall back to String

use serde::{Deserialize, Serialize};

/// A source column as reported by schema introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// `information_schema.columns.data_type`, e.g. "timestamp without time zone"
    pub data_type: String,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A sink column derived from a [`ColumnSchema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkColumnSchema {
    pub name: String,
    /// Base ClickHouse type without the `Nullable` wrapper.
    pub sink_type: String,
    pub nullable: bool,
}

impl SinkColumnSchema {
    /// The full column type as written in DDL.
    pub fn ddl_type(&self) -> String {
        if self.nullable {
            format!("Nullable({})", self.sink_type)
        } else {
            self.sink_type.clone()
        }
    }
}

/// Map a single PostgreSQL data type to its ClickHouse counterpart.
pub fn map_type(source_type: &str) -> &'static str {
    match source_type.trim().to_ascii_lowercase().as_str() {
        "smallint" | "int2" => "Int16",
        "integer" | "int" | "int4" => "Int32",
        "bigint" | "int8" => "Int64",
        "real" | "float4" => "Float32",
        "double precision" | "float8" => "Float64",
        "numeric" | "decimal" => "Decimal(38, 10)",
        "boolean" | "bool" => "Bool",
        "uuid" => "UUID",
        "date" => "Date32",
        "timestamp without time zone" | "timestamp" => "DateTime64(6)",
        "timestamp with time zone" | "timestamptz" => "DateTime64(6, 'UTC')",
        // text, varchar, json, bytea, time, interval, arrays, enums
        _ => "String",
    }
}

/// Derive the sink schema for a table, preserving column order.
///
/// Key columns are not nullable because ClickHouse sorting keys reject
/// `Nullable` types.
pub fn map_schema(columns: &[ColumnSchema], primary_key: &[String]) -> Vec<SinkColumnSchema> {
    columns
        .iter()
        .map(|col| SinkColumnSchema {
            name: col.name.clone(),
            sink_type: map_type(&col.data_type).to_string(),
            nullable: !primary_key.iter().any(|pk| pk == &col.name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_types() {
        assert_eq!(map_type("smallint"), "Int16");
        assert_eq!(map_type("integer"), "Int32");
        assert_eq!(map_type("bigint"), "Int64");
        assert_eq!(map_type("INTEGER"), "Int32");
    }

    #[test]
    fn test_temporal_types() {
        assert_eq!(map_type("timestamp without time zone"), "DateTime64(6)");
        assert_eq!(map_type("timestamp with time zone"), "DateTime64(6, 'UTC')");
        assert_eq!(map_type("date"), "Date32");
        assert_eq!(map_type("time without time zone"), "String");
    }

    #[test]
    fn test_fallback_to_string() {
        assert_eq!(map_type("character varying"), "String");
        assert_eq!(map_type("jsonb"), "String");
        assert_eq!(map_type("ARRAY"), "String");
        assert_eq!(map_type("USER-DEFINED"), "String");
    }

    #[test]
    fn test_map_schema_keeps_order_and_key_nullability() {
        let columns = vec![
            ColumnSchema::new("id", "bigint"),
            ColumnSchema::new("name", "text"),
            ColumnSchema::new("updated_at", "timestamp without time zone"),
        ];
        let mapped = map_schema(&columns, &["id".to_string()]);

        let names: Vec<&str> = mapped.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "updated_at"]);
        assert_eq!(mapped[0].ddl_type(), "Int64");
        assert_eq!(mapped[1].ddl_type(), "Nullable(String)");
        assert_eq!(mapped[2].ddl_type(), "Nullable(DateTime64(6))");
    }

    #[test]
    fn test_map_schema_without_key_is_all_nullable() {
        let columns = vec![ColumnSchema::new("id", "integer")];
        let mapped = map_schema(&columns, &[]);
        assert!(mapped[0].nullable);
    }
}
