//! Staging-file codec.
//!
//! Every step hands its output to the next one as a CSV file with a fixed
//! header. Writes are atomic (temp file + rename) so a crashed step never
//! leaves a half-written file that a later step would pick up.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{normalize_date, CleanRecord, MergedRecord, RawRecord, Source};
use crate::schema;

pub const RAW_COLUMNS: &[&str] = &[
    "symbol",
    "date",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "source",
    "extracted_at",
];

pub const CLEAN_COLUMNS: &[&str] = &[
    "symbol",
    "date",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "daily_change",
    "volatility",
    "source",
    "extracted_at",
    "processed_at",
];

/// The merged file carries exactly the warehouse columns.
pub fn merged_columns() -> Vec<&'static str> {
    schema::column_names()
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CSV error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{}: row {row}: unparseable date '{value}'", path.display())]
    BadDate {
        path: PathBuf,
        row: usize,
        value: String,
    },
}

impl StagingError {
    fn io(path: &Path, source: io::Error) -> Self {
        StagingError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        StagingError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `records` under an explicit header.
///
/// The header is written even for an empty slice so that downstream steps can
/// tell an empty dataset apart from a malformed file.
pub fn write_records<T: Serialize>(
    path: &Path,
    columns: &[&str],
    records: &[T],
) -> Result<(), StagingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StagingError::io(parent, e))?;
    }
    let tmp = path.with_extension("csv.tmp");
    {
        let file = fs::File::create(&tmp).map_err(|e| StagingError::io(&tmp, e))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(io::BufWriter::new(file));
        writer
            .write_record(columns)
            .map_err(|e| StagingError::csv(&tmp, e))?;
        for record in records {
            writer
                .serialize(record)
                .map_err(|e| StagingError::csv(&tmp, e))?;
        }
        writer
            .flush()
            .map_err(|e| StagingError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StagingError::io(path, e))?;
    Ok(())
}

pub fn write_raw(path: &Path, records: &[RawRecord]) -> Result<(), StagingError> {
    write_records(path, RAW_COLUMNS, records)
}

pub fn write_clean(path: &Path, records: &[CleanRecord]) -> Result<(), StagingError> {
    write_records(path, CLEAN_COLUMNS, records)
}

pub fn write_merged(path: &Path, records: &[MergedRecord]) -> Result<(), StagingError> {
    write_records(path, &merged_columns(), records)
}

fn open_reader(path: &Path) -> Result<csv::Reader<fs::File>, StagingError> {
    if !path.exists() {
        return Err(StagingError::Missing(path.to_path_buf()));
    }
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| StagingError::csv(path, e))
}

fn read_rows<T: DeserializeOwned, R: io::Read>(
    reader: &mut csv::Reader<R>,
    path: &Path,
) -> Result<Vec<T>, StagingError> {
    reader
        .deserialize()
        .map(|row| row.map_err(|e| StagingError::csv(path, e)))
        .collect()
}

/// Raw rows keep the date as text; providers and hand-edited files disagree
/// on its format.
#[derive(Debug, Deserialize)]
struct RawRow {
    symbol: String,
    date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    source: Source,
    extracted_at: DateTime<Utc>,
}

pub fn read_raw(path: &Path) -> Result<Vec<RawRecord>, StagingError> {
    let mut reader = open_reader(path)?;
    let rows: Vec<RawRow> = read_rows(&mut reader, path)?;
    rows.into_iter()
        .enumerate()
        .map(|(i, row)| {
            let date = normalize_date(&row.date).ok_or_else(|| StagingError::BadDate {
                path: path.to_path_buf(),
                row: i + 1,
                value: row.date.clone(),
            })?;
            Ok(RawRecord {
                symbol: row.symbol,
                date,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                source: row.source,
                extracted_at: row.extracted_at,
            })
        })
        .collect()
}

pub fn read_clean(path: &Path) -> Result<Vec<CleanRecord>, StagingError> {
    let mut reader = open_reader(path)?;
    read_rows(&mut reader, path)
}

pub fn read_merged(path: &Path) -> Result<Vec<MergedRecord>, StagingError> {
    let mut reader = open_reader(path)?;
    read_rows(&mut reader, path)
}

/// Decode a merged dataset fetched from object storage. `origin` names the
/// object in error messages.
pub fn read_merged_bytes(bytes: &[u8], origin: &str) -> Result<Vec<MergedRecord>, StagingError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);
    read_rows(&mut reader, Path::new(origin))
}

/// Header row of a staging file.
pub fn read_header(path: &Path) -> Result<Vec<String>, StagingError> {
    let mut reader = open_reader(path)?;
    let headers = reader.headers().map_err(|e| StagingError::csv(path, e))?;
    Ok(headers.iter().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MergedSource;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn merged(symbol: &str, date: &str) -> MergedRecord {
        MergedRecord {
            symbol: symbol.into(),
            date: d(date),
            open: 187.15,
            high: 188.44,
            low: 183.89,
            close: 185.64,
            volume: 82_488_700,
            daily_change: None,
            volatility: Some(1.25),
            source: MergedSource::AlphaVantage,
        }
    }

    #[test]
    fn merged_header_is_warehouse_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.csv");
        write_merged(&path, &[merged("AAPL", "2024-01-02")]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let first = text.lines().next().unwrap();
        assert_eq!(
            first,
            "symbol,date,open,high,low,close,volume,daily_change,volatility,source"
        );
        assert!(text.contains("AAPL,2024-01-02,187.15,188.44,183.89,185.64,82488700,,1.25,alpha_vantage"));

        let back = read_merged(&path).unwrap();
        assert_eq!(back, vec![merged("AAPL", "2024-01-02")]);
        assert!(!path.with_extension("csv.tmp").exists());
    }

    #[test]
    fn empty_dataset_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        write_raw(&path, &[]).unwrap();
        assert_eq!(read_header(&path).unwrap(), RAW_COLUMNS);
        assert!(read_raw(&path).unwrap().is_empty());
    }

    #[test]
    fn raw_reader_normalizes_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        fs::write(
            &path,
            "symbol,date,open,high,low,close,volume,source,extracted_at\n\
             AAPL,2024-01-02 00:00:00-05:00,187.15,188.44,183.89,185.64,82488700,yahoo_finance,2024-01-03T06:00:00Z\n",
        )
        .unwrap();
        let rows = read_raw(&path).unwrap();
        assert_eq!(rows[0].date, d("2024-01-02"));
        assert_eq!(rows[0].source, Source::YahooFinance);
    }

    #[test]
    fn raw_reader_rejects_bad_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        fs::write(
            &path,
            "symbol,date,open,high,low,close,volume,source,extracted_at\n\
             AAPL,02/01/2024,1,1,1,1,1,alpha_vantage,2024-01-03T06:00:00Z\n",
        )
        .unwrap();
        let err = read_raw(&path).unwrap_err();
        assert!(matches!(err, StagingError::BadDate { row: 1, .. }));
    }

    #[test]
    fn missing_file_is_named() {
        let err = read_clean(Path::new("/nonexistent/clean.csv")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/clean.csv"));
    }

    #[test]
    fn bytes_decode_matches_file_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.csv");
        let rows = vec![merged("AAPL", "2024-01-02"), merged("MSFT", "2024-01-02")];
        write_merged(&path, &rows).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(read_merged_bytes(&bytes, "stock_data/x.csv").unwrap(), rows);
    }
}
