//! Warehouse table contract.
//!
//! The merged staging file, the uploaded object and the warehouse table all
//! share this column list, in this order. The table is partitioned by `date`
//! and clustered by `symbol`.

use serde::{Deserialize, Serialize};

/// Column types as the warehouse names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    String,
    Date,
    Float64,
    Int64,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Date => "DATE",
            ColumnType::Float64 => "FLOAT64",
            ColumnType::Int64 => "INT64",
        }
    }
}

/// A single column of the warehouse table.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub dtype: ColumnType,
    pub nullable: bool,
}

const fn required(name: &'static str, dtype: ColumnType) -> ColumnSpec {
    ColumnSpec {
        name,
        dtype,
        nullable: false,
    }
}

const fn nullable(name: &'static str, dtype: ColumnType) -> ColumnSpec {
    ColumnSpec {
        name,
        dtype,
        nullable: true,
    }
}

pub const WAREHOUSE_SCHEMA: &[ColumnSpec] = &[
    required("symbol", ColumnType::String),
    required("date", ColumnType::Date),
    required("open", ColumnType::Float64),
    required("high", ColumnType::Float64),
    required("low", ColumnType::Float64),
    required("close", ColumnType::Float64),
    required("volume", ColumnType::Int64),
    nullable("daily_change", ColumnType::Float64),
    nullable("volatility", ColumnType::Float64),
    required("source", ColumnType::String),
];

pub const PARTITION_COLUMN: &str = "date";
pub const CLUSTER_COLUMN: &str = "symbol";

pub fn column_names() -> Vec<&'static str> {
    WAREHOUSE_SCHEMA.iter().map(|c| c.name).collect()
}

pub fn column(name: &str) -> Option<&'static ColumnSpec> {
    WAREHOUSE_SCHEMA.iter().find(|c| c.name == name)
}

/// Result of comparing a header row against the warehouse schema.
#[derive(Debug, Clone)]
pub struct SchemaValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// Check that `columns` is exactly the warehouse column list, in order.
pub fn validate_columns(columns: &[&str]) -> SchemaValidation {
    let mut errors = Vec::new();

    for expected in WAREHOUSE_SCHEMA {
        if !columns.contains(&expected.name) {
            errors.push(format!("missing required column '{}'", expected.name));
        }
    }
    for name in columns {
        if column(name).is_none() {
            errors.push(format!("unexpected column '{name}' (not in warehouse schema)"));
        }
    }
    if errors.is_empty() && columns != column_names().as_slice() {
        errors.push(format!(
            "column order {:?} differs from warehouse order {:?}",
            columns,
            column_names()
        ));
    }

    SchemaValidation {
        is_valid: errors.is_empty(),
        errors,
    }
}

/// `CREATE TABLE IF NOT EXISTS` statement for the target table.
pub fn create_table_ddl(table_ref: &str) -> String {
    let cols: Vec<String> = WAREHOUSE_SCHEMA
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("  {} {}{}", c.name, c.dtype.as_sql(), null)
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS `{table_ref}` (\n{}\n)\nPARTITION BY {PARTITION_COLUMN}\nCLUSTER BY {CLUSTER_COLUMN}",
        cols.join(",\n")
    )
}

/// Table schema in the JSON shape of the BigQuery REST API (`schema.fields`).
pub fn bigquery_fields() -> serde_json::Value {
    let fields: Vec<serde_json::Value> = WAREHOUSE_SCHEMA
        .iter()
        .map(|c| {
            serde_json::json!({
                "name": c.name,
                "type": c.dtype.as_sql(),
                "mode": if c.nullable { "NULLABLE" } else { "REQUIRED" },
            })
        })
        .collect();
    serde_json::Value::Array(fields)
}
