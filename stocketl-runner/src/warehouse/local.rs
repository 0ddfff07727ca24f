//! Local Parquet warehouse.
//!
//! Layout: `{root}/{dataset}/{table}/date=YYYY-MM-DD/part-{load_id}.parquet`,
//! plus `_schema.json` (the table contract) and `_loads.jsonl` (one line per
//! append, never rewritten).

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use stocketl_core::domain::{MergedRecord, MergedSource};
use stocketl_core::schema;

use super::{Warehouse, WarehouseError};

const PARTITION_PREFIX: &str = "date=";
const SCHEMA_FILE: &str = "_schema.json";
const LEDGER_FILE: &str = "_loads.jsonl";

/// One line of the load ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub load_id: String,
    pub loaded_at: chrono::DateTime<Utc>,
    pub partitions: Vec<NaiveDate>,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct LocalWarehouse {
    root: PathBuf,
    dataset: String,
    table: String,
}

impl LocalWarehouse {
    pub fn new(root: impl AsRef<Path>, dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    pub fn table_dir(&self) -> PathBuf {
        self.root.join(&self.dataset).join(&self.table)
    }

    fn partition_dir(&self, date: NaiveDate) -> PathBuf {
        self.table_dir().join(format!("{PARTITION_PREFIX}{date}"))
    }

    fn ledger_path(&self) -> PathBuf {
        self.table_dir().join(LEDGER_FILE)
    }

    /// All ledger entries, oldest first.
    pub fn ledger(&self) -> Result<Vec<LedgerEntry>, WarehouseError> {
        let path = self.ledger_path();
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&path, e)),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| WarehouseError::BadResponse(format!("ledger line: {e}")))
            })
            .collect()
    }

    fn append_ledger(&self, entry: &LedgerEntry) -> Result<(), WarehouseError> {
        let path = self.ledger_path();
        let json = serde_json::to_string(entry)
            .map_err(|e| WarehouseError::BadResponse(format!("ledger serialization: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        writeln!(file, "{json}").map_err(|e| io_err(&path, e))?;
        file.flush().map_err(|e| io_err(&path, e))
    }

    fn parquet_files(dir: &Path) -> Result<Vec<PathBuf>, WarehouseError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
            let path = entry.map_err(|e| io_err(dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> WarehouseError {
    WarehouseError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn parquet_err(path: &Path, e: impl std::fmt::Display) -> WarehouseError {
    WarehouseError::Parquet {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Rows to a DataFrame with the warehouse column names and types.
pub(crate) fn rows_to_dataframe(rows: &[&MergedRecord]) -> Result<DataFrame, WarehouseError> {
    let mut volumes = Vec::with_capacity(rows.len());
    for r in rows {
        let v = i64::try_from(r.volume).map_err(|_| WarehouseError::BadRow {
            symbol: r.symbol.clone(),
            date: r.date,
            message: format!("volume {} exceeds INT64", r.volume),
        })?;
        volumes.push(v);
    }
    let dates: Vec<i32> = rows
        .iter()
        .map(|r| (r.date - epoch()).num_days() as i32)
        .collect();

    DataFrame::new(vec![
        Column::new("symbol".into(), rows.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>()),
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| parquet_err(Path::new("<memory>"), e))?,
        Column::new("open".into(), rows.iter().map(|r| r.open).collect::<Vec<_>>()),
        Column::new("high".into(), rows.iter().map(|r| r.high).collect::<Vec<_>>()),
        Column::new("low".into(), rows.iter().map(|r| r.low).collect::<Vec<_>>()),
        Column::new("close".into(), rows.iter().map(|r| r.close).collect::<Vec<_>>()),
        Column::new("volume".into(), volumes),
        Column::new(
            "daily_change".into(),
            rows.iter().map(|r| r.daily_change).collect::<Vec<_>>(),
        ),
        Column::new(
            "volatility".into(),
            rows.iter().map(|r| r.volatility).collect::<Vec<_>>(),
        ),
        Column::new(
            "source".into(),
            rows.iter().map(|r| r.source.as_str()).collect::<Vec<_>>(),
        ),
    ])
    .map_err(|e| parquet_err(Path::new("<memory>"), e))
}

fn dataframe_to_rows(df: &DataFrame, path: &Path) -> Result<Vec<MergedRecord>, WarehouseError> {
    let names: Vec<&str> = df.get_column_names().iter().map(|n| n.as_str()).collect();
    let check = schema::validate_columns(&names);
    if !check.is_valid {
        return Err(parquet_err(path, check.errors.join("; ")));
    }

    let col = |name: &str| df.column(name).map_err(|e| parquet_err(path, e));
    let symbols = col("symbol")?.str().map_err(|e| parquet_err(path, e))?.clone();
    let dates = col("date")?.date().map_err(|e| parquet_err(path, e))?.clone();
    let f64_col = |name: &str| -> Result<Float64Chunked, WarehouseError> {
        Ok(col(name)?.f64().map_err(|e| parquet_err(path, e))?.clone())
    };
    let (open, high, low, close) = (f64_col("open")?, f64_col("high")?, f64_col("low")?, f64_col("close")?);
    let daily_change = f64_col("daily_change")?;
    let volatility = f64_col("volatility")?;
    let volume = col("volume")?.i64().map_err(|e| parquet_err(path, e))?.clone();
    let sources = col("source")?.str().map_err(|e| parquet_err(path, e))?.clone();

    let null = |i: usize, name: &str| parquet_err(path, format!("null {name} at row {i}"));
    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let date = epoch() + chrono::Duration::days(i64::from(dates.get(i).ok_or_else(|| null(i, "date"))?));
        let source_text = sources.get(i).ok_or_else(|| null(i, "source"))?;
        let source: MergedSource = source_text.parse().map_err(|e| parquet_err(path, e))?;
        let volume = volume.get(i).ok_or_else(|| null(i, "volume"))?;
        rows.push(MergedRecord {
            symbol: symbols.get(i).ok_or_else(|| null(i, "symbol"))?.to_string(),
            date,
            open: open.get(i).ok_or_else(|| null(i, "open"))?,
            high: high.get(i).ok_or_else(|| null(i, "high"))?,
            low: low.get(i).ok_or_else(|| null(i, "low"))?,
            close: close.get(i).ok_or_else(|| null(i, "close"))?,
            volume: u64::try_from(volume).map_err(|_| parquet_err(path, format!("negative volume at row {i}")))?,
            daily_change: daily_change.get(i),
            volatility: volatility.get(i),
            source,
        });
    }
    Ok(rows)
}

/// `part-{load_id}.parquet`, or `part-{load_id}-{n}.parquet` when a retried
/// load with the same id already left a part file in this partition.
fn part_path(dir: &Path, load_id: &str) -> PathBuf {
    let first = dir.join(format!("part-{load_id}.parquet"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| dir.join(format!("part-{load_id}-{n}.parquet")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn write_parquet_atomic(df: &mut DataFrame, path: &Path) -> Result<(), WarehouseError> {
    let tmp = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| parquet_err(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_err(path, e)
    })
}

impl Warehouse for LocalWarehouse {
    fn name(&self) -> &str {
        "local"
    }

    fn table_ref(&self) -> String {
        format!("{}.{}", self.dataset, self.table)
    }

    fn ensure_table(&self) -> Result<(), WarehouseError> {
        let dir = self.table_dir();
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let schema_path = dir.join(SCHEMA_FILE);
        if !schema_path.exists() {
            let contract = serde_json::json!({
                "table": self.table_ref(),
                "fields": schema::bigquery_fields(),
                "partition_by": schema::PARTITION_COLUMN,
                "cluster_by": schema::CLUSTER_COLUMN,
            });
            let text = serde_json::to_string_pretty(&contract)
                .map_err(|e| WarehouseError::BadResponse(e.to_string()))?;
            fs::write(&schema_path, text).map_err(|e| io_err(&schema_path, e))?;
            tracing::info!(table = %self.table_ref(), path = %dir.display(), "created local table");
        }
        Ok(())
    }

    fn loaded_partitions(&self) -> Result<BTreeSet<NaiveDate>, WarehouseError> {
        let dir = self.table_dir();
        if !dir.exists() {
            return Ok(BTreeSet::new());
        }
        let mut dates = BTreeSet::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let path = entry.map_err(|e| io_err(&dir, e))?.path();
            let Some(date) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(PARTITION_PREFIX))
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if path.is_dir() && !Self::parquet_files(&path)?.is_empty() {
                dates.insert(date);
            }
        }
        Ok(dates)
    }

    fn append(&self, rows: &[MergedRecord], load_id: &str) -> Result<usize, WarehouseError> {
        if !self.table_dir().join(SCHEMA_FILE).exists() {
            return Err(WarehouseError::MissingTable(self.table_ref()));
        }

        let mut by_date: std::collections::BTreeMap<NaiveDate, Vec<&MergedRecord>> =
            std::collections::BTreeMap::new();
        for row in rows {
            by_date.entry(row.date).or_default().push(row);
        }

        let mut written = 0;
        let mut partitions = Vec::with_capacity(by_date.len());
        for (date, mut partition) in by_date {
            partition.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            let dir = self.partition_dir(date);
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            let path = part_path(&dir, load_id);
            let mut df = rows_to_dataframe(&partition)?;
            write_parquet_atomic(&mut df, &path)?;
            tracing::debug!(partition = %date, rows = partition.len(), path = %path.display(), "wrote partition");
            written += partition.len();
            partitions.push(date);
        }

        self.append_ledger(&LedgerEntry {
            load_id: load_id.to_string(),
            loaded_at: Utc::now(),
            partitions,
            rows: written,
        })?;
        Ok(written)
    }

    fn partition_rows(&self, date: NaiveDate) -> Result<Vec<MergedRecord>, WarehouseError> {
        let dir = self.partition_dir(date);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for path in Self::parquet_files(&dir)? {
            let file = fs::File::open(&path).map_err(|e| io_err(&path, e))?;
            let df = ParquetReader::new(file)
                .finish()
                .map_err(|e| parquet_err(&path, e))?;
            rows.extend(dataframe_to_rows(&df, &path)?);
        }
        rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(rows)
    }
}
