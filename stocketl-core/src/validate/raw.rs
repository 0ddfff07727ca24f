//! Raw staging file validation.
//!
//! Raw files hold warm-up history before the window, so only dates after the
//! window end are temporal errors here. Coverage is measured inside the window.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};

use super::report::{ValidationReport, ViolationKind, WarningKind};
use super::{
    bar_warnings, check_dataset, check_ohlc, finish_metrics, price, read_table, required, volume,
    Ohlc, DEFAULT_MAX_STALENESS_DAYS,
};
use crate::domain::{normalize_date, DateWindow, Source};
use crate::staging::{StagingError, RAW_COLUMNS};

#[derive(Debug, Clone)]
pub struct RawRules {
    pub symbols: Vec<String>,
    pub window: DateWindow,
    /// Reference date for "future" and staleness checks, normally the run date.
    pub as_of: NaiveDate,
    /// Source every row must carry, when validating a single extractor's file.
    pub expected_source: Option<Source>,
    pub max_staleness_days: Option<i64>,
}

impl RawRules {
    pub fn new(symbols: Vec<String>, window: DateWindow, as_of: NaiveDate) -> Self {
        Self {
            symbols,
            window,
            as_of,
            expected_source: None,
            max_staleness_days: Some(DEFAULT_MAX_STALENESS_DAYS),
        }
    }

    pub fn for_source(mut self, source: Source) -> Self {
        self.expected_source = Some(source);
        self
    }
}

pub fn validate_raw_file(path: &Path, rules: &RawRules) -> Result<ValidationReport, StagingError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut report = ValidationReport::new(name);
    let (columns, rows) = read_table(path, &mut report)?;

    let missing: Vec<&str> = RAW_COLUMNS.iter().copied().filter(|c| !columns.has(c)).collect();
    for col in &missing {
        report.violation(
            ViolationKind::MissingField,
            None,
            format!("required column '{col}' is missing"),
        );
    }
    for col in columns.names() {
        if !RAW_COLUMNS.contains(&col) {
            report.warn(
                WarningKind::ExtraColumn,
                None,
                format!("unexpected column '{col}'"),
            );
        }
    }
    if !missing.is_empty() {
        return Ok(report);
    }

    let mut seen_keys: HashSet<(String, NaiveDate, String)> = HashSet::new();
    let mut last_date: HashMap<(String, String), NaiveDate> = HashMap::new();
    let mut in_window: BTreeMap<String, BTreeSet<NaiveDate>> = BTreeMap::new();
    let mut symbols: BTreeSet<String> = BTreeSet::new();

    for (row, record) in &rows {
        let row = *row;
        report.metrics.record_count += 1;

        let symbol = required(&mut report, row, "symbol", columns.get(record, "symbol"));
        let source_text = columns.get(record, "source");
        let source = required(&mut report, row, "source", source_text).and_then(|s| {
            match s.parse::<Source>() {
                Ok(src) => Some(src),
                Err(e) => {
                    report.violation(ViolationKind::TypeMismatch, Some(row), e.to_string());
                    None
                }
            }
        });
        if let (Some(expected), Some(found)) = (rules.expected_source, source) {
            if expected != found {
                report.violation(
                    ViolationKind::TypeMismatch,
                    Some(row),
                    format!("source '{found}' in a {expected} file"),
                );
            }
        }
        *report
            .metrics
            .per_source
            .entry(source_text.to_string())
            .or_default() += 1;

        let date_text = columns.get(record, "date");
        let date = required(&mut report, row, "date", date_text).and_then(|t| {
            let parsed = normalize_date(t);
            if parsed.is_none() {
                report.violation(
                    ViolationKind::TypeMismatch,
                    Some(row),
                    format!("unparseable date '{t}'"),
                );
            }
            parsed
        });

        let extracted = columns.get(record, "extracted_at");
        if required(&mut report, row, "extracted_at", extracted).is_some()
            && extracted.parse::<DateTime<Utc>>().is_err()
        {
            report.violation(
                ViolationKind::TypeMismatch,
                Some(row),
                format!("unparseable extracted_at '{extracted}'"),
            );
        }

        let open = price(&mut report, row, "open", columns.get(record, "open"));
        let high = price(&mut report, row, "high", columns.get(record, "high"));
        let low = price(&mut report, row, "low", columns.get(record, "low"));
        let close = price(&mut report, row, "close", columns.get(record, "close"));
        let vol = volume(&mut report, row, columns.get(record, "volume"));

        let bar = match (open, high, low, close) {
            (Some(open), Some(high), Some(low), Some(close)) => {
                let bar = Ohlc { open, high, low, close };
                check_ohlc(&mut report, row, bar);
                Some(bar)
            }
            _ => None,
        };

        let (Some(symbol), Some(date)) = (symbol, date) else {
            continue;
        };
        report.metrics.observe_date(date);
        symbols.insert(symbol.to_string());

        if !rules.symbols.iter().any(|s| s == symbol) {
            report.violation(
                ViolationKind::UnknownSymbol,
                Some(row),
                format!("symbol '{symbol}' is not configured"),
            );
        }
        if date > rules.as_of {
            report.violation(
                ViolationKind::TemporalInconsistency,
                Some(row),
                format!("date {date} is in the future (as of {})", rules.as_of),
            );
        } else if date > rules.window.end {
            report.violation(
                ViolationKind::TemporalInconsistency,
                Some(row),
                format!("date {date} is after the extraction window {}", rules.window),
            );
        }

        if !seen_keys.insert((symbol.to_string(), date, source_text.to_string())) {
            report.violation(
                ViolationKind::DuplicateKey,
                Some(row),
                format!("duplicate record for {symbol} on {date} from {source_text}"),
            );
        }
        let series = (symbol.to_string(), source_text.to_string());
        if let Some(prev) = last_date.insert(series, date) {
            if date < prev {
                report.violation(
                    ViolationKind::TemporalInconsistency,
                    Some(row),
                    format!("{symbol} rows are not sorted by date ({date} after {prev})"),
                );
            }
        }
        if rules.window.contains(date) {
            in_window.entry(symbol.to_string()).or_default().insert(date);
        }
        if let (Some(bar), Some(vol)) = (bar, vol) {
            bar_warnings(&mut report, row, date, rules.as_of, bar, vol);
        }
    }

    finish_metrics(&mut report, &symbols);
    check_dataset(
        &mut report,
        &rules.symbols,
        rules.window,
        &in_window,
        rules.max_staleness_days,
        rules.as_of,
    );
    Ok(report)
}
