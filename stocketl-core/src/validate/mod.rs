//! Data quality checks for staged files.
//!
//! Validators read the staging CSV as text so that malformed values surface as
//! findings with a row number instead of aborting the read. Only a missing or
//! unreadable file is an error.

pub mod raw;
pub mod report;
pub mod transformed;

pub use raw::{validate_raw_file, RawRules};
pub use report::{
    ValidationMetrics, ValidationReport, Violation, ViolationKind, Warning, WarningKind,
};
pub use transformed::{validate_merged_file, TransformedRules};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::{Duration, NaiveDate};

use crate::domain::DateWindow;
use crate::staging::StagingError;

pub const MAX_REASONABLE_CLOSE: f64 = 10_000.0;
pub const MAX_REASONABLE_VOLUME: u64 = 1_000_000_000;
pub const MAX_INTRADAY_RANGE_PCT: f64 = 20.0;
pub const OLD_RECORD_DAYS: i64 = 365;
pub const DEFAULT_MAX_STALENESS_DAYS: i64 = 5;

/// Header-indexed access to CSV rows.
pub(crate) struct Columns {
    index: HashMap<String, usize>,
    names: Vec<String>,
}

impl Columns {
    fn new(header: &csv::StringRecord) -> Self {
        let names: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        Self { index, names }
    }

    fn names(&self) -> Vec<&str> {
        self.names.iter().map(String::as_str).collect()
    }

    fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Trimmed field; empty when the column is absent.
    fn get<'r>(&self, row: &'r csv::StringRecord, name: &str) -> &'r str {
        self.index
            .get(name)
            .and_then(|&i| row.get(i))
            .map(str::trim)
            .unwrap_or("")
    }
}

/// Open a staged CSV and return its columns plus every row; unreadable rows
/// become `TypeMismatch` violations.
pub(crate) fn read_table(
    path: &Path,
    report: &mut ValidationReport,
) -> Result<(Columns, Vec<(usize, csv::StringRecord)>), StagingError> {
    if !path.exists() {
        return Err(StagingError::Missing(path.to_path_buf()));
    }
    let csv_err = |source| StagingError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let columns = Columns::new(reader.headers().map_err(csv_err)?);

    let mut rows = Vec::new();
    for (i, row) in reader.records().enumerate() {
        match row {
            Ok(r) if r.len() != columns.names.len() => report.violation(
                ViolationKind::TypeMismatch,
                Some(i + 1),
                format!("expected {} fields, found {}", columns.names.len(), r.len()),
            ),
            Ok(r) => rows.push((i + 1, r)),
            Err(e) => report.violation(ViolationKind::TypeMismatch, Some(i + 1), e.to_string()),
        }
    }
    Ok((columns, rows))
}

/// Non-empty value or a `MissingField` violation.
pub(crate) fn required<'r>(
    report: &mut ValidationReport,
    row: usize,
    name: &str,
    value: &'r str,
) -> Option<&'r str> {
    if value.is_empty() {
        report.violation(ViolationKind::MissingField, Some(row), format!("'{name}' is empty"));
        None
    } else {
        Some(value)
    }
}

/// Required price: must parse, be finite and positive.
pub(crate) fn price(report: &mut ValidationReport, row: usize, name: &str, value: &str) -> Option<f64> {
    let value = required(report, row, name, value)?;
    let Ok(p) = value.parse::<f64>() else {
        report.violation(
            ViolationKind::TypeMismatch,
            Some(row),
            format!("'{name}' is not a number: '{value}'"),
        );
        return None;
    };
    if !p.is_finite() || p <= 0.0 {
        report.violation(
            ViolationKind::OutOfRange,
            Some(row),
            format!("'{name}' must be a positive finite price, got {p}"),
        );
        return None;
    }
    Some(p)
}

pub(crate) fn volume(report: &mut ValidationReport, row: usize, value: &str) -> Option<u64> {
    let value = required(report, row, "volume", value)?;
    match value.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            report.violation(
                ViolationKind::TypeMismatch,
                Some(row),
                format!("'volume' is not a non-negative integer: '{value}'"),
            );
            None
        }
    }
}

/// Optional derived metric; empty is allowed, garbage is not.
pub(crate) fn optional_f64(
    report: &mut ValidationReport,
    row: usize,
    name: &str,
    value: &str,
) -> Option<Option<f64>> {
    if value.is_empty() {
        return Some(None);
    }
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(Some(v)),
        _ => {
            report.violation(
                ViolationKind::TypeMismatch,
                Some(row),
                format!("'{name}' is not a finite number: '{value}'"),
            );
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Bar consistency: `low <= open, close <= high`.
pub(crate) fn check_ohlc(report: &mut ValidationReport, row: usize, bar: Ohlc) {
    if bar.high < bar.low {
        report.violation(
            ViolationKind::OutOfRange,
            Some(row),
            format!("high {} below low {}", bar.high, bar.low),
        );
        return;
    }
    for (name, v) in [("open", bar.open), ("close", bar.close)] {
        if v < bar.low || v > bar.high {
            report.violation(
                ViolationKind::OutOfRange,
                Some(row),
                format!("{name} {v} outside [{}, {}]", bar.low, bar.high),
            );
        }
    }
}

/// Plausibility warnings shared by both validators.
pub(crate) fn bar_warnings(
    report: &mut ValidationReport,
    row: usize,
    date: NaiveDate,
    as_of: NaiveDate,
    bar: Ohlc,
    volume: u64,
) {
    if date < as_of - Duration::days(OLD_RECORD_DAYS) {
        report.warn(
            WarningKind::OldRecord,
            Some(row),
            format!("record dated {date} is more than a year old"),
        );
    }
    if bar.close > MAX_REASONABLE_CLOSE {
        report.warn(
            WarningKind::HighPrice,
            Some(row),
            format!("close {} above {MAX_REASONABLE_CLOSE}", bar.close),
        );
    }
    if volume > MAX_REASONABLE_VOLUME {
        report.warn(
            WarningKind::HighVolume,
            Some(row),
            format!("volume {volume} above {MAX_REASONABLE_VOLUME}"),
        );
    }
    let range_pct = (bar.high - bar.low) / bar.open * 100.0;
    if range_pct > MAX_INTRADAY_RANGE_PCT {
        report.warn(
            WarningKind::WideRange,
            Some(row),
            format!("intraday range {range_pct:.1}% of open exceeds {MAX_INTRADAY_RANGE_PCT}%"),
        );
    }
}

/// Dataset-level checks once every row has been seen.
///
/// `in_window` maps each symbol to its dates inside the window. The union of
/// those dates is the file's trading calendar; every configured symbol must
/// cover all of it.
pub(crate) fn check_dataset(
    report: &mut ValidationReport,
    symbols: &[String],
    window: DateWindow,
    in_window: &BTreeMap<String, BTreeSet<NaiveDate>>,
    max_staleness_days: Option<i64>,
    as_of: NaiveDate,
) {
    if report.metrics.record_count == 0 {
        report.violation(ViolationKind::EmptyDataset, None, "dataset has no records");
        return;
    }
    let calendar: BTreeSet<NaiveDate> = in_window.values().flatten().copied().collect();
    for symbol in symbols {
        let Some(dates) = in_window.get(symbol) else {
            report.violation(
                ViolationKind::MissingSymbol,
                None,
                format!("no records for '{symbol}' in {window}"),
            );
            continue;
        };
        let missing: Vec<NaiveDate> = calendar.difference(dates).copied().collect();
        if let Some(first) = missing.first() {
            report.violation(
                ViolationKind::MissingDate,
                None,
                format!(
                    "'{symbol}' is missing {} trading day(s) in {window} that other symbols have (first {first})",
                    missing.len()
                ),
            );
        }
    }
    if let (Some(max_days), Some(newest)) = (max_staleness_days, report.metrics.last_date) {
        let age = (as_of - newest).num_days();
        if age > max_days {
            report.violation(
                ViolationKind::Stale,
                None,
                format!("newest record {newest} is {age} days behind {as_of} (limit {max_days})"),
            );
        }
    }
}

pub(crate) fn finish_metrics(report: &mut ValidationReport, seen_symbols: &BTreeSet<String>) {
    report.metrics.symbol_count = seen_symbols.len();
}
