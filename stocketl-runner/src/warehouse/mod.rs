//! Analytical warehouse: one append-only table partitioned by record date.
//!
//! Loading is idempotent with a "reject" policy keyed by (symbol, date): a row
//! whose key is already in the table is skipped, never rewritten. Loading the
//! same data twice appends nothing the second time, and a load that failed
//! halfway through a partition is completed by the next attempt.

pub mod bigquery;
pub mod local;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stocketl_core::domain::MergedRecord;

use crate::auth::AuthError;

pub use bigquery::BigQueryWarehouse;
pub use local::LocalWarehouse;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error in {path}: {message}")]
    Parquet { path: String, message: String },

    #[error("warehouse request failed: {0}")]
    Http(String),

    #[error("warehouse rejected {count} row(s): {first}")]
    InsertRejected { count: usize, first: String },

    #[error("table {0} does not exist; run ensure_table first")]
    MissingTable(String),

    #[error("row for {symbol} on {date} cannot be stored: {message}")]
    BadRow {
        symbol: String,
        date: NaiveDate,
        message: String,
    },

    #[error("unexpected warehouse response: {0}")]
    BadResponse(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Target table of the loader.
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &str;

    /// Fully qualified table name for logs.
    fn table_ref(&self) -> String;

    /// Create the table with the fixed schema if it does not exist.
    fn ensure_table(&self) -> Result<(), WarehouseError>;

    /// Dates that already have at least one row.
    fn loaded_partitions(&self) -> Result<BTreeSet<NaiveDate>, WarehouseError>;

    /// (symbol, date) keys already stored for the given dates.
    fn loaded_keys(&self, dates: &BTreeSet<NaiveDate>) -> Result<BTreeSet<RowKey>, WarehouseError> {
        let present = self.loaded_partitions()?;
        let mut keys = BTreeSet::new();
        for date in dates.intersection(&present) {
            keys.extend(self.partition_rows(*date)?.into_iter().map(|r| (r.symbol, r.date)));
        }
        Ok(keys)
    }

    /// Append rows as-is. Returns the number of rows written.
    fn append(&self, rows: &[MergedRecord], load_id: &str) -> Result<usize, WarehouseError>;

    /// All rows of one partition, sorted by symbol.
    fn partition_rows(&self, date: NaiveDate) -> Result<Vec<MergedRecord>, WarehouseError>;
}

/// Identity of a warehouse row.
pub type RowKey = (String, NaiveDate);

/// Outcome of [`load_idempotent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub load_id: String,
    pub table: String,
    /// Dates that received at least one row.
    pub partitions_loaded: Vec<NaiveDate>,
    /// Dates whose rows were all present already.
    pub partitions_skipped: Vec<NaiveDate>,
    /// Loaded dates that already held some of their rows from an earlier, failed load.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions_completed: Vec<NaiveDate>,
    pub rows_appended: usize,
    pub rows_skipped: usize,
    pub loaded_at: DateTime<Utc>,
}

/// Append the rows whose (symbol, date) key the warehouse does not hold yet.
pub fn load_idempotent(
    warehouse: &dyn Warehouse,
    rows: &[MergedRecord],
    load_id: &str,
) -> Result<LoadSummary, WarehouseError> {
    warehouse.ensure_table()?;

    let mut by_date: BTreeMap<NaiveDate, Vec<&MergedRecord>> = BTreeMap::new();
    for row in rows {
        by_date.entry(row.date).or_default().push(row);
    }
    let dates: BTreeSet<NaiveDate> = by_date.keys().copied().collect();
    let existing = if dates.is_empty() {
        BTreeSet::new()
    } else {
        warehouse.loaded_keys(&dates)?
    };

    let mut to_append = Vec::new();
    let mut partitions_loaded = Vec::new();
    let mut partitions_skipped = Vec::new();
    let mut partitions_completed = Vec::new();
    let mut rows_skipped = 0;

    for (date, partition) in by_date {
        let total = partition.len();
        let missing: Vec<MergedRecord> = partition
            .into_iter()
            .filter(|r| !existing.contains(&(r.symbol.clone(), r.date)))
            .cloned()
            .collect();
        let present = total - missing.len();
        rows_skipped += present;

        if missing.is_empty() {
            tracing::info!(
                table = %warehouse.table_ref(),
                partition = %date,
                rows = total,
                "partition already loaded, skipping"
            );
            partitions_skipped.push(date);
            continue;
        }
        if present > 0 {
            tracing::warn!(
                table = %warehouse.table_ref(),
                partition = %date,
                present,
                missing = missing.len(),
                "partition partially loaded, appending the missing rows"
            );
            partitions_completed.push(date);
        }
        partitions_loaded.push(date);
        to_append.extend(missing);
    }

    let rows_appended = if to_append.is_empty() {
        0
    } else {
        warehouse.append(&to_append, load_id)?
    };

    tracing::info!(
        table = %warehouse.table_ref(),
        load_id,
        partitions_loaded = partitions_loaded.len(),
        partitions_skipped = partitions_skipped.len(),
        rows_appended,
        "load finished"
    );

    Ok(LoadSummary {
        load_id: load_id.to_string(),
        table: warehouse.table_ref(),
        partitions_loaded,
        partitions_skipped,
        partitions_completed,
        rows_appended,
        rows_skipped,
        loaded_at: Utc::now(),
    })
}
