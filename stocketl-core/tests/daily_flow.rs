//! Staged files through validation, transform and merge for one trading day.
//!
//! Symbols = [AAPL], window = 2024-01-02. Each source stages warm-up history
//! plus the window day; the merged file must hold exactly one AAPL row whose
//! daily change is measured against 2023-12-29, the prior trading day.

use chrono::{NaiveDate, TimeZone, Utc};
use stocketl_core::domain::{DateWindow, MergedSource, RawRecord, Source};
use stocketl_core::merge::{merge, MergeOptions};
use stocketl_core::staging;
use stocketl_core::transform::{transform, TransformOptions};
use stocketl_core::validate::{validate_merged_file, validate_raw_file, RawRules, TransformedRules};

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// (date, open, high, low, close, volume) for AAPL around the 2024 new year.
const AAPL: &[(&str, f64, f64, f64, f64, u64)] = &[
    ("2023-12-26", 193.61, 193.89, 192.83, 193.05, 28_919_300),
    ("2023-12-27", 192.49, 193.50, 191.09, 193.15, 48_087_700),
    ("2023-12-28", 194.14, 194.66, 193.17, 193.58, 34_049_900),
    ("2023-12-29", 193.90, 194.40, 191.73, 192.53, 42_628_800),
    ("2024-01-02", 187.15, 188.44, 183.89, 185.64, 82_488_700),
];

fn raw(source: Source, close_bump: f64) -> Vec<RawRecord> {
    let extracted_at = Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap();
    AAPL.iter()
        .map(|&(date, open, high, low, close, volume)| RawRecord {
            symbol: "AAPL".into(),
            date: d(date),
            open,
            high: high + close_bump,
            low,
            close: close + close_bump,
            volume,
            source,
            extracted_at,
        })
        .collect()
}

#[test]
fn single_day_window_yields_one_merged_row() {
    let dir = tempfile::tempdir().unwrap();
    let window = DateWindow::single(d("2024-01-02"));
    let symbols = vec!["AAPL".to_string()];

    let av_path = dir.path().join("alpha_vantage_raw.csv");
    let yf_path = dir.path().join("yahoo_finance_raw.csv");
    staging::write_raw(&av_path, &raw(Source::AlphaVantage, 0.0)).unwrap();
    staging::write_raw(&yf_path, &raw(Source::YahooFinance, 0.01)).unwrap();

    for (path, source) in [(&av_path, Source::AlphaVantage), (&yf_path, Source::YahooFinance)] {
        let rules = RawRules::new(symbols.clone(), window, d("2024-01-02")).for_source(source);
        let report = validate_raw_file(path, &rules).unwrap();
        assert!(report.passed(), "{}", report.summary(10));
        assert_eq!(report.metrics.record_count, AAPL.len());
    }

    let opts = TransformOptions {
        window,
        volatility_window: 3,
        processed_at: Utc::now(),
    };
    let av_clean = transform(&staging::read_raw(&av_path).unwrap(), &opts).unwrap();
    let yf_clean = transform(&staging::read_raw(&yf_path).unwrap(), &opts).unwrap();
    assert_eq!(av_clean.len(), 1);
    assert_eq!(yf_clean.len(), 1);

    let change = av_clean[0].daily_change.unwrap();
    assert!((change - (185.64 - 192.53)).abs() < 1e-9);

    let out = merge(&av_clean, &yf_clean, &MergeOptions::new(window, symbols.clone())).unwrap();
    assert_eq!(out.records.len(), 1);
    assert_eq!(out.report.conflicts_resolved, 1);
    assert_eq!(out.records[0].source, MergedSource::AlphaVantage);
    assert_eq!(out.records[0].close, 185.64);

    let merged_path = dir.path().join("merged_stock_data.csv");
    staging::write_merged(&merged_path, &out.records).unwrap();
    let rules = TransformedRules::new(symbols, window, d("2024-01-02"));
    let report =
        validate_merged_file(&merged_path, &rules, Some((&av_clean[..], &yf_clean[..]))).unwrap();
    assert!(report.passed(), "{}", report.summary(10));
    assert!(report.warnings.is_empty());
    assert_eq!(staging::read_merged(&merged_path).unwrap(), out.records);
}
