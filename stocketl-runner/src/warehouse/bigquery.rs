//! BigQuery over the v2 REST API.
//!
//! DDL, partition and key lookups go through `jobs.query`; rows are streamed
//! with `tabledata.insertAll` using `{symbol}-{date}` insert ids so a retried
//! request does not duplicate rows. A batch that fails leaves the rows of
//! earlier batches in place; the loader's key lookup appends only the rest on
//! the next attempt.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use stocketl_core::domain::MergedRecord;
use stocketl_core::schema;

use super::{RowKey, Warehouse, WarehouseError};
use crate::auth::TokenSource;

pub const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const INSERT_BATCH: usize = 500;
const QUERY_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<Value>,
}

pub struct BigQueryWarehouse {
    client: Client,
    base_url: String,
    project: String,
    dataset: String,
    table: String,
    tokens: Arc<dyn TokenSource>,
}

impl BigQueryWarehouse {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, WarehouseError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| WarehouseError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
            tokens,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn post(&self, url: String, body: &Value) -> Result<Value, WarehouseError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(self.tokens.token()?)
            .json(body)
            .send()
            .map_err(|e| WarehouseError::Http(e.without_url().to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .map_err(|e| WarehouseError::Http(e.to_string()))?;
        if !status.is_success() {
            let snippet: String = text.chars().take(300).collect();
            return Err(WarehouseError::Http(format!("HTTP {status}: {snippet}")));
        }
        serde_json::from_str(&text).map_err(|e| WarehouseError::BadResponse(e.to_string()))
    }

    fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<TableRow>, WarehouseError> {
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        if !params.is_empty() {
            body["parameterMode"] = json!("NAMED");
            body["queryParameters"] = Value::Array(params);
        }
        let url = format!("{}/projects/{}/queries", self.base_url, self.project);
        let resp: QueryResponse = serde_json::from_value(self.post(url, &body)?)
            .map_err(|e| WarehouseError::BadResponse(e.to_string()))?;
        if let Some(first) = resp.errors.first() {
            return Err(WarehouseError::BadResponse(first.to_string()));
        }
        if !resp.job_complete {
            return Err(WarehouseError::BadResponse(format!(
                "query did not complete within {QUERY_TIMEOUT_MS} ms"
            )));
        }
        Ok(resp.rows)
    }
}

/// `insertAll` row for one record.
pub(crate) fn insert_row(r: &MergedRecord) -> Value {
    json!({
        "insertId": format!("{}-{}", r.symbol, r.date),
        "json": {
            "symbol": r.symbol,
            "date": r.date.to_string(),
            "open": r.open,
            "high": r.high,
            "low": r.low,
            "close": r.close,
            "volume": r.volume,
            "daily_change": r.daily_change,
            "volatility": r.volatility,
            "source": r.source.as_str(),
        }
    })
}

fn cell_str(cell: &TableCell) -> Option<&str> {
    cell.v.as_str()
}

fn cell_f64(cell: &TableCell, name: &str) -> Result<Option<f64>, WarehouseError> {
    match cell_str(cell) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| WarehouseError::BadResponse(format!("{name} '{s}' is not a number"))),
    }
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, WarehouseError> {
    value.ok_or_else(|| WarehouseError::BadResponse(format!("null {name} in result row")))
}

fn date_param(name: &str, date: NaiveDate) -> Value {
    json!({
        "name": name,
        "parameterType": { "type": "DATE" },
        "parameterValue": { "value": date.to_string() },
    })
}

/// Decode a row of `SELECT symbol, CAST(date AS STRING)`.
fn decode_key(row: &TableRow) -> Result<RowKey, WarehouseError> {
    let (Some(symbol), Some(date)) = (
        row.f.first().and_then(cell_str),
        row.f.get(1).and_then(cell_str),
    ) else {
        return Err(WarehouseError::BadResponse("key row needs symbol and date".into()));
    };
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| WarehouseError::BadResponse(format!("date '{date}': {e}")))?;
    Ok((symbol.to_string(), date))
}

/// Decode a row of `SELECT <warehouse columns>`; BigQuery returns every scalar as a string.
fn decode_row(row: &TableRow) -> Result<MergedRecord, WarehouseError> {
    let names = schema::column_names();
    if row.f.len() != names.len() {
        return Err(WarehouseError::BadResponse(format!(
            "expected {} cells, got {}",
            names.len(),
            row.f.len()
        )));
    }
    let f = &row.f;
    let date_text = required(cell_str(&f[1]), "date")?;
    let volume_text = required(cell_str(&f[6]), "volume")?;
    let source_text = required(cell_str(&f[9]), "source")?;
    Ok(MergedRecord {
        symbol: required(cell_str(&f[0]), "symbol")?.to_string(),
        date: NaiveDate::parse_from_str(date_text, "%Y-%m-%d")
            .map_err(|e| WarehouseError::BadResponse(format!("date '{date_text}': {e}")))?,
        open: required(cell_f64(&f[2], "open")?, "open")?,
        high: required(cell_f64(&f[3], "high")?, "high")?,
        low: required(cell_f64(&f[4], "low")?, "low")?,
        close: required(cell_f64(&f[5], "close")?, "close")?,
        volume: volume_text
            .parse()
            .map_err(|_| WarehouseError::BadResponse(format!("volume '{volume_text}'")))?,
        daily_change: cell_f64(&f[7], "daily_change")?,
        volatility: cell_f64(&f[8], "volatility")?,
        source: source_text
            .parse()
            .map_err(|e| WarehouseError::BadResponse(format!("{e}")))?,
    })
}

impl Warehouse for BigQueryWarehouse {
    fn name(&self) -> &str {
        "bigquery"
    }

    fn table_ref(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }

    fn ensure_table(&self) -> Result<(), WarehouseError> {
        self.query(&schema::create_table_ddl(&self.table_ref()), Vec::new())?;
        tracing::debug!(table = %self.table_ref(), "table ensured");
        Ok(())
    }

    fn loaded_partitions(&self) -> Result<BTreeSet<NaiveDate>, WarehouseError> {
        let sql = format!(
            "SELECT DISTINCT CAST(date AS STRING) FROM `{}`",
            self.table_ref()
        );
        self.query(&sql, Vec::new())?
            .iter()
            .map(|row| {
                let text = row.f.first().and_then(cell_str).unwrap_or_default();
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .map_err(|e| WarehouseError::BadResponse(format!("partition '{text}': {e}")))
            })
            .collect()
    }

    fn loaded_keys(&self, dates: &BTreeSet<NaiveDate>) -> Result<BTreeSet<RowKey>, WarehouseError> {
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Ok(BTreeSet::new());
        };
        let sql = format!(
            "SELECT symbol, CAST({p} AS STRING) FROM `{}` WHERE {p} BETWEEN @first AND @last",
            self.table_ref(),
            p = schema::PARTITION_COLUMN
        );
        let rows = self.query(&sql, vec![date_param("first", *first), date_param("last", *last)])?;
        let mut keys = BTreeSet::new();
        for row in &rows {
            let key = decode_key(row)?;
            if dates.contains(&key.1) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    fn append(&self, rows: &[MergedRecord], _load_id: &str) -> Result<usize, WarehouseError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}/insertAll",
            self.base_url, self.project, self.dataset, self.table
        );
        let mut written = 0;
        for batch in rows.chunks(INSERT_BATCH) {
            let body = json!({
                "skipInvalidRows": false,
                "ignoreUnknownValues": false,
                "rows": batch.iter().map(insert_row).collect::<Vec<_>>(),
            });
            let resp: InsertAllResponse = serde_json::from_value(self.post(url.clone(), &body)?)
                .map_err(|e| WarehouseError::BadResponse(e.to_string()))?;
            if let Some(first) = resp.insert_errors.first() {
                return Err(WarehouseError::InsertRejected {
                    count: resp.insert_errors.len(),
                    first: first.to_string(),
                });
            }
            written += batch.len();
            tracing::debug!(table = %self.table_ref(), rows = batch.len(), "inserted batch");
        }
        Ok(written)
    }

    fn partition_rows(&self, date: NaiveDate) -> Result<Vec<MergedRecord>, WarehouseError> {
        let columns: Vec<String> = schema::column_names()
            .into_iter()
            .map(|c| {
                if c == schema::PARTITION_COLUMN {
                    format!("CAST({c} AS STRING)")
                } else {
                    c.to_string()
                }
            })
            .collect();
        let sql = format!(
            "SELECT {} FROM `{}` WHERE {} = @partition ORDER BY symbol",
            columns.join(", "),
            self.table_ref(),
            schema::PARTITION_COLUMN
        );
        self.query(&sql, vec![date_param("partition", date)])?
            .iter()
            .map(decode_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_rows::row;
    use super::*;
    use stocketl_core::domain::MergedSource;

    #[test]
    fn insert_row_uses_deterministic_id() {
        let v = insert_row(&row("AAPL", "2024-01-02", 185.64));
        assert_eq!(v["insertId"], "AAPL-2024-01-02");
        assert_eq!(v["json"]["date"], "2024-01-02");
        assert_eq!(v["json"]["volatility"], Value::Null);
        assert_eq!(v["json"]["source"], "alpha_vantage");
    }

    #[test]
    fn decodes_query_rows() {
        let resp: QueryResponse = serde_json::from_str(
            r#"{"jobComplete": true, "rows": [{"f": [
                {"v": "AAPL"}, {"v": "2024-01-02"}, {"v": "187.15"}, {"v": "188.44"},
                {"v": "183.885"}, {"v": "185.64"}, {"v": "82488700"}, {"v": "-6.39"},
                {"v": null}, {"v": "blended"}
            ]}]}"#,
        )
        .unwrap();
        let r = decode_row(&resp.rows[0]).unwrap();
        assert_eq!(r.symbol, "AAPL");
        assert_eq!(r.close, 185.64);
        assert_eq!(r.volume, 82_488_700);
        assert_eq!(r.daily_change, Some(-6.39));
        assert_eq!(r.volatility, None);
        assert_eq!(r.source, MergedSource::Blended);
    }

    #[test]
    fn decodes_key_rows() {
        let resp: QueryResponse = serde_json::from_str(
            r#"{"jobComplete": true, "rows": [
                {"f": [{"v": "AAPL"}, {"v": "2024-01-02"}]},
                {"f": [{"v": "MSFT"}, {"v": null}]}
            ]}"#,
        )
        .unwrap();
        let key = decode_key(&resp.rows[0]).unwrap();
        assert_eq!(key, ("AAPL".to_string(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()));
        assert!(decode_key(&resp.rows[1]).is_err());
    }

    #[test]
    fn short_rows_are_rejected() {
        let resp: QueryResponse =
            serde_json::from_str(r#"{"jobComplete": true, "rows": [{"f": [{"v": "AAPL"}]}]}"#).unwrap();
        assert!(decode_row(&resp.rows[0]).is_err());
    }
}
