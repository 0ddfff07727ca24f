//! Merged staging file validation.
//!
//! The merged file is what gets uploaded and loaded, so its header must be the
//! warehouse schema exactly and every row must sit inside the window.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use chrono::NaiveDate;

use super::report::{ValidationReport, ViolationKind, WarningKind};
use super::{
    bar_warnings, check_dataset, check_ohlc, finish_metrics, optional_f64, price, read_table,
    required, volume, Ohlc, DEFAULT_MAX_STALENESS_DAYS,
};
use crate::domain::{CleanRecord, DateWindow, MergedSource};
use crate::merge::{find_discrepancies, DEFAULT_DISCREPANCY_PCT};
use crate::schema;
use crate::staging::StagingError;

#[derive(Debug, Clone)]
pub struct TransformedRules {
    pub symbols: Vec<String>,
    pub window: DateWindow,
    pub as_of: NaiveDate,
    pub max_staleness_days: Option<i64>,
    pub discrepancy_threshold_pct: f64,
}

impl TransformedRules {
    pub fn new(symbols: Vec<String>, window: DateWindow, as_of: NaiveDate) -> Self {
        Self {
            symbols,
            window,
            as_of,
            max_staleness_days: Some(DEFAULT_MAX_STALENESS_DAYS),
            discrepancy_threshold_pct: DEFAULT_DISCREPANCY_PCT,
        }
    }
}

/// Validate the merged file. `sources` are the two clean datasets the merge was
/// built from; when given, cross-source close discrepancies become warnings.
pub fn validate_merged_file(
    path: &Path,
    rules: &TransformedRules,
    sources: Option<(&[CleanRecord], &[CleanRecord])>,
) -> Result<ValidationReport, StagingError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut report = ValidationReport::new(name);
    let (columns, rows) = read_table(path, &mut report)?;

    let header = columns.names();
    let schema_check = schema::validate_columns(&header);
    if !schema_check.is_valid {
        for err in schema_check.errors {
            report.violation(ViolationKind::SchemaMismatch, None, err);
        }
        return Ok(report);
    }

    let mut seen_keys: HashSet<(String, NaiveDate)> = HashSet::new();
    let mut previous: Option<(NaiveDate, String)> = None;
    let mut in_window: BTreeMap<String, BTreeSet<NaiveDate>> = BTreeMap::new();
    let mut symbols: BTreeSet<String> = BTreeSet::new();

    for (row, record) in &rows {
        let row = *row;
        report.metrics.record_count += 1;

        let symbol = required(&mut report, row, "symbol", columns.get(record, "symbol"));
        let date = required(&mut report, row, "date", columns.get(record, "date")).and_then(|t| {
            match NaiveDate::parse_from_str(t, "%Y-%m-%d") {
                Ok(d) => Some(d),
                Err(_) => {
                    report.violation(
                        ViolationKind::TypeMismatch,
                        Some(row),
                        format!("date '{t}' is not YYYY-MM-DD"),
                    );
                    None
                }
            }
        });

        let source_text = columns.get(record, "source");
        if let Some(s) = required(&mut report, row, "source", source_text) {
            if let Err(e) = s.parse::<MergedSource>() {
                report.violation(ViolationKind::TypeMismatch, Some(row), e.to_string());
            }
        }
        *report
            .metrics
            .per_source
            .entry(source_text.to_string())
            .or_default() += 1;

        let open = price(&mut report, row, "open", columns.get(record, "open"));
        let high = price(&mut report, row, "high", columns.get(record, "high"));
        let low = price(&mut report, row, "low", columns.get(record, "low"));
        let close = price(&mut report, row, "close", columns.get(record, "close"));
        let vol = volume(&mut report, row, columns.get(record, "volume"));
        optional_f64(&mut report, row, "daily_change", columns.get(record, "daily_change"));
        let volatility = optional_f64(&mut report, row, "volatility", columns.get(record, "volatility"));
        if let Some(Some(v)) = volatility {
            if v < 0.0 {
                report.violation(
                    ViolationKind::OutOfRange,
                    Some(row),
                    format!("volatility {v} is negative"),
                );
            }
        }

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
        }
        if rules.window.contains(date) {
            in_window.entry(symbol.to_string()).or_default().insert(date);
        } else {
            report.violation(
                ViolationKind::TemporalInconsistency,
                Some(row),
                format!("date {date} is outside the extraction window {}", rules.window),
            );
        }
        if !seen_keys.insert((symbol.to_string(), date)) {
            report.violation(
                ViolationKind::DuplicateKey,
                Some(row),
                format!("more than one record for {symbol} on {date}"),
            );
        }

        let key = (date, symbol.to_string());
        if let Some(prev) = &previous {
            if key < *prev {
                report.violation(
                    ViolationKind::TemporalInconsistency,
                    Some(row),
                    format!("rows are not sorted by (date, symbol): {symbol} {date} after {} {}", prev.1, prev.0),
                );
            }
        }
        previous = Some(key);

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

    if let Some((left, right)) = sources {
        for d in find_discrepancies(left, right, rules.discrepancy_threshold_pct) {
            report.warn(
                WarningKind::SourceDiscrepancy,
                None,
                format!(
                    "{} {}: alpha_vantage close {} vs yahoo_finance close {} ({:.2}%)",
                    d.symbol, d.date, d.alpha_vantage_close, d.yahoo_finance_close, d.pct_diff
                ),
            );
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Source;
    use chrono::Utc;
    use std::fs;

    const HEADER: &str = "symbol,date,open,high,low,close,volume,daily_change,volatility,source\n";

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn rules() -> TransformedRules {
        TransformedRules::new(
            vec!["AAPL".into(), "MSFT".into()],
            DateWindow::new(d("2024-01-02"), d("2024-01-03")).unwrap(),
            d("2024-01-03"),
        )
    }

    fn validate_with(body: &str, sources: Option<(&[CleanRecord], &[CleanRecord])>) -> ValidationReport {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged_stock_data.csv");
        fs::write(&path, format!("{HEADER}{body}")).unwrap();
        validate_merged_file(&path, &rules(), sources).unwrap()
    }

    fn validate(body: &str) -> ValidationReport {
        validate_with(body, None)
    }

    const GOOD: &str = "AAPL,2024-01-02,187.15,188.44,183.89,185.64,82488700,-6.89,,alpha_vantage\n\
                        MSFT,2024-01-02,373.86,375.90,366.77,370.87,25258600,-5.91,,yahoo_finance\n\
                        AAPL,2024-01-03,184.22,185.88,183.43,184.25,58414500,-1.39,2.1,blended\n\
                        MSFT,2024-01-03,369.01,373.26,368.51,370.60,23083500,-0.27,1.8,alpha_vantage\n";

    #[test]
    fn well_formed_file_passes() {
        let report = validate(GOOD);
        assert!(report.passed(), "{}", report.summary(10));
        assert_eq!(report.metrics.record_count, 4);
        assert_eq!(report.metrics.symbol_count, 2);
        assert_eq!(report.metrics.first_date, Some(d("2024-01-02")));
    }

    #[test]
    fn schema_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.csv");
        fs::write(
            &path,
            "symbol,date,open,high,low,close,volume,source\nAAPL,2024-01-02,1,1,1,1,1,alpha_vantage\n",
        )
        .unwrap();
        let report = validate_merged_file(&path, &rules(), None).unwrap();
        assert!(report.has_violation(ViolationKind::SchemaMismatch));
    }

    #[test]
    fn out_of_window_and_duplicates_fail() {
        let report = validate(&format!(
            "{GOOD}AAPL,2024-01-03,184.22,185.88,183.43,184.25,58414500,,,alpha_vantage\n\
             AAPL,2024-01-04,182.15,183.09,180.88,181.91,71983600,,,alpha_vantage\n"
        ));
        assert!(report.has_violation(ViolationKind::DuplicateKey));
        assert!(report.has_violation(ViolationKind::TemporalInconsistency));
    }

    #[test]
    fn gap_in_one_symbol_fails() {
        let report = validate(
            "AAPL,2024-01-02,187.15,188.44,183.89,185.64,82488700,-6.89,,alpha_vantage\n\
             MSFT,2024-01-02,373.86,375.90,366.77,370.87,25258600,-5.91,,yahoo_finance\n\
             AAPL,2024-01-03,184.22,185.88,183.43,184.25,58414500,-1.39,2.1,blended\n",
        );
        assert!(report.has_violation(ViolationKind::MissingDate));
        assert_eq!(report.violations.len(), 1);
    }

    #[test]
    fn negative_volatility_fails() {
        let report = validate(
            "AAPL,2024-01-02,187.15,188.44,183.89,185.64,82488700,,-0.1,alpha_vantage\n\
             MSFT,2024-01-02,373.86,375.90,366.77,370.87,25258600,,,alpha_vantage\n",
        );
        assert!(report.has_violation(ViolationKind::OutOfRange));
    }

    #[test]
    fn unsorted_rows_fail() {
        let report = validate(
            "MSFT,2024-01-02,373.86,375.90,366.77,370.87,25258600,,,alpha_vantage\n\
             AAPL,2024-01-02,187.15,188.44,183.89,185.64,82488700,,,alpha_vantage\n",
        );
        assert!(report.has_violation(ViolationKind::TemporalInconsistency));
    }

    #[test]
    fn discrepancies_are_warnings() {
        let clean = |close: f64, source: Source| CleanRecord {
            symbol: "AAPL".into(),
            date: d("2024-01-02"),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1,
            daily_change: None,
            volatility: None,
            source,
            extracted_at: Utc::now(),
            processed_at: Utc::now(),
        };
        let av = vec![clean(185.64, Source::AlphaVantage)];
        let yf = vec![clean(200.0, Source::YahooFinance)];
        let report = validate_with(GOOD, Some((av.as_slice(), yf.as_slice())));
        assert!(report.passed());
        assert!(report.has_warning(WarningKind::SourceDiscrepancy));
    }
}
