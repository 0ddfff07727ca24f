//! Cross-source merge.
//!
//! Combines the clean Alpha Vantage and Yahoo Finance datasets into one record
//! per (symbol, date). A key present in both sources is a conflict, resolved by
//! an explicit [`ConflictPolicy`]; the merger never picks silently.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{CleanRecord, DateWindow, MergedRecord, MergedSource, Source};

pub const DEFAULT_DISCREPANCY_PCT: f64 = 5.0;

/// How a (symbol, date) present in more than one source is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConflictPolicy {
    /// Keep the given source's record; fall back to the other when it is absent.
    Prefer(Source),
    /// Mean of every numeric column, tagged `blended`.
    Average,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::Prefer(Source::AlphaVantage)
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Prefer(source) => write!(f, "prefer_{source}"),
            ConflictPolicy::Average => f.write_str("average"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "average" {
            return Ok(ConflictPolicy::Average);
        }
        s.strip_prefix("prefer_")
            .and_then(|rest| rest.parse::<Source>().ok())
            .map(ConflictPolicy::Prefer)
            .ok_or_else(|| {
                format!(
                    "unknown conflict policy '{s}' (expected prefer_alpha_vantage, prefer_yahoo_finance or average)"
                )
            })
    }
}

impl TryFrom<String> for ConflictPolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConflictPolicy> for String {
    fn from(policy: ConflictPolicy) -> Self {
        policy.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub policy: ConflictPolicy,
    pub window: DateWindow,
    pub symbols: Vec<String>,
    pub discrepancy_threshold_pct: f64,
}

impl MergeOptions {
    pub fn new(window: DateWindow, symbols: Vec<String>) -> Self {
        Self {
            policy: ConflictPolicy::default(),
            window,
            symbols,
            discrepancy_threshold_pct: DEFAULT_DISCREPANCY_PCT,
        }
    }
}

/// Closes that disagree by more than the threshold for the same (symbol, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub symbol: String,
    pub date: NaiveDate,
    pub alpha_vantage_close: f64,
    pub yahoo_finance_close: f64,
    /// `|yf - av| / av * 100`
    pub pct_diff: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub input_records: usize,
    pub merged_records: usize,
    pub conflicts_resolved: usize,
    pub duplicates_dropped: usize,
    pub out_of_scope_dropped: usize,
    pub discrepancies: Vec<Discrepancy>,
}

#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub records: Vec<MergedRecord>,
    pub report: MergeReport,
}

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("{origin} has two different records for {symbol} on {date}")]
    ConflictingDuplicate {
        symbol: String,
        date: NaiveDate,
        origin: Source,
    },
}

type Key = (NaiveDate, String);

/// Group records by (date, symbol), then by source. Exact repeats are dropped
/// and counted; differing repeats are an error.
fn index<'a>(
    datasets: &[&'a [CleanRecord]],
    opts: &MergeOptions,
    report: &mut MergeReport,
) -> Result<BTreeMap<Key, BTreeMap<Source, &'a CleanRecord>>, MergeError> {
    let mut keyed: BTreeMap<Key, BTreeMap<Source, &CleanRecord>> = BTreeMap::new();
    for record in datasets.iter().copied().flatten() {
        report.input_records += 1;
        if !opts.window.contains(record.date) || !opts.symbols.contains(&record.symbol) {
            report.out_of_scope_dropped += 1;
            continue;
        }
        let by_source = keyed
            .entry((record.date, record.symbol.clone()))
            .or_default();
        match by_source.get(&record.source) {
            Some(existing) if existing.same_values(record) => report.duplicates_dropped += 1,
            Some(_) => {
                return Err(MergeError::ConflictingDuplicate {
                    symbol: record.symbol.clone(),
                    date: record.date,
                    origin: record.source,
                })
            }
            None => {
                by_source.insert(record.source, record);
            }
        }
    }
    Ok(keyed)
}

fn discrepancy(
    symbol: &str,
    date: NaiveDate,
    by_source: &BTreeMap<Source, &CleanRecord>,
    threshold_pct: f64,
) -> Option<Discrepancy> {
    let av = by_source.get(&Source::AlphaVantage)?.close;
    let yf = by_source.get(&Source::YahooFinance)?.close;
    if av == 0.0 {
        return None;
    }
    let pct_diff = (yf - av).abs() / av.abs() * 100.0;
    (pct_diff > threshold_pct).then(|| Discrepancy {
        symbol: symbol.to_string(),
        date,
        alpha_vantage_close: av,
        yahoo_finance_close: yf,
        pct_diff,
    })
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    sum / n as f64
}

fn mean_opt(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let present: Vec<f64> = values.flatten().collect();
    (!present.is_empty()).then(|| mean(present.into_iter()))
}

fn blend(records: &[&CleanRecord]) -> MergedRecord {
    let n = records.len() as u128;
    let volume_sum: u128 = records.iter().map(|r| r.volume as u128).sum();
    MergedRecord {
        symbol: records[0].symbol.clone(),
        date: records[0].date,
        open: mean(records.iter().map(|r| r.open)),
        high: mean(records.iter().map(|r| r.high)),
        low: mean(records.iter().map(|r| r.low)),
        close: mean(records.iter().map(|r| r.close)),
        volume: ((volume_sum + n / 2) / n) as u64,
        daily_change: mean_opt(records.iter().map(|r| r.daily_change)),
        volatility: mean_opt(records.iter().map(|r| r.volatility)),
        source: MergedSource::Blended,
    }
}

fn resolve(by_source: &BTreeMap<Source, &CleanRecord>, policy: ConflictPolicy) -> Option<MergedRecord> {
    match policy {
        ConflictPolicy::Prefer(preferred) => by_source
            .get(&preferred)
            .or_else(|| by_source.values().next())
            .map(|r| MergedRecord::from(*r)),
        ConflictPolicy::Average => {
            let records: Vec<&CleanRecord> = by_source.values().copied().collect();
            (!records.is_empty()).then(|| blend(&records))
        }
    }
}

/// Merge two clean datasets into one record per (symbol, date), sorted by
/// (date, symbol).
pub fn merge(
    left: &[CleanRecord],
    right: &[CleanRecord],
    opts: &MergeOptions,
) -> Result<MergeOutput, MergeError> {
    let mut report = MergeReport::default();
    let keyed = index(&[left, right], opts, &mut report)?;

    let mut records = Vec::with_capacity(keyed.len());
    for ((date, symbol), by_source) in &keyed {
        let record = if by_source.len() > 1 {
            report.conflicts_resolved += 1;
            if let Some(d) = discrepancy(symbol, *date, by_source, opts.discrepancy_threshold_pct) {
                report.discrepancies.push(d);
            }
            resolve(by_source, opts.policy)
        } else {
            by_source.values().next().map(|r| MergedRecord::from(*r))
        };
        records.extend(record);
    }
    report.merged_records = records.len();

    tracing::info!(
        input = report.input_records,
        merged = report.merged_records,
        conflicts = report.conflicts_resolved,
        duplicates = report.duplicates_dropped,
        out_of_scope = report.out_of_scope_dropped,
        policy = %opts.policy,
        "merged datasets"
    );
    Ok(MergeOutput { records, report })
}

/// Cross-source close discrepancies above `threshold_pct`, ordered by (date, symbol).
pub fn find_discrepancies(
    left: &[CleanRecord],
    right: &[CleanRecord],
    threshold_pct: f64,
) -> Vec<Discrepancy> {
    let mut keyed: BTreeMap<Key, BTreeMap<Source, &CleanRecord>> = BTreeMap::new();
    for record in left.iter().chain(right) {
        keyed
            .entry((record.date, record.symbol.clone()))
            .or_default()
            .entry(record.source)
            .or_insert(record);
    }
    keyed
        .iter()
        .filter_map(|((date, symbol), by_source)| {
            discrepancy(symbol, *date, by_source, threshold_pct)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn clean(symbol: &str, date: &str, close: f64, source: Source) -> CleanRecord {
        CleanRecord {
            symbol: symbol.into(),
            date: d(date),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_001,
            daily_change: Some(0.5),
            volatility: None,
            source,
            extracted_at: Utc::now(),
            processed_at: Utc::now(),
        }
    }

    fn opts(policy: ConflictPolicy) -> MergeOptions {
        let mut o = MergeOptions::new(
            DateWindow::new(d("2024-01-01"), d("2024-01-31")).unwrap(),
            vec!["AAPL".into(), "MSFT".into()],
        );
        o.policy = policy;
        o
    }

    #[test]
    fn policy_text_forms() {
        for text in ["prefer_alpha_vantage", "prefer_yahoo_finance", "average"] {
            let p: ConflictPolicy = text.parse().unwrap();
            assert_eq!(p.to_string(), text);
        }
        assert!("prefer_bloomberg".parse::<ConflictPolicy>().is_err());
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::Prefer(Source::AlphaVantage));
    }

    #[test]
    fn prefer_keeps_preferred_source() {
        let av = vec![clean("AAPL", "2024-01-02", 185.64, Source::AlphaVantage)];
        let yf = vec![
            clean("AAPL", "2024-01-02", 185.60, Source::YahooFinance),
            clean("AAPL", "2024-01-03", 184.25, Source::YahooFinance),
        ];
        let out = merge(&av, &yf, &opts(ConflictPolicy::default())).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].close, 185.64);
        assert_eq!(out.records[0].source, MergedSource::AlphaVantage);
        assert_eq!(out.records[1].source, MergedSource::YahooFinance);
        assert_eq!(out.report.conflicts_resolved, 1);
        assert!(out.report.discrepancies.is_empty());

        let out = merge(&av, &yf, &opts(ConflictPolicy::Prefer(Source::YahooFinance))).unwrap();
        assert_eq!(out.records[0].close, 185.60);
    }

    #[test]
    fn average_blends_values() {
        let mut a = clean("AAPL", "2024-01-02", 100.0, Source::AlphaVantage);
        a.volume = 1;
        let mut b = clean("AAPL", "2024-01-02", 110.0, Source::YahooFinance);
        b.volume = 2;
        b.daily_change = None;
        let out = merge(&[a], &[b], &opts(ConflictPolicy::Average)).unwrap();
        let r = &out.records[0];
        assert_eq!(r.close, 105.0);
        assert_eq!(r.volume, 2);
        assert_eq!(r.daily_change, Some(0.5));
        assert_eq!(r.source, MergedSource::Blended);
        assert_eq!(out.report.discrepancies.len(), 1);
        assert!((out.report.discrepancies[0].pct_diff - 10.0).abs() < 1e-9);
    }

    #[test]
    fn identical_single_source_datasets_have_no_conflicts() {
        let av = vec![
            clean("AAPL", "2024-01-02", 185.64, Source::AlphaVantage),
            clean("MSFT", "2024-01-02", 370.87, Source::AlphaVantage),
        ];
        let out = merge(&av, &av.clone(), &opts(ConflictPolicy::default())).unwrap();
        assert_eq!(out.report.conflicts_resolved, 0);
        assert_eq!(out.report.duplicates_dropped, 2);
        assert_eq!(out.records.len(), 2);
    }

    #[test]
    fn differing_same_source_duplicate_is_error() {
        let a = clean("AAPL", "2024-01-02", 185.64, Source::AlphaVantage);
        let b = clean("AAPL", "2024-01-02", 186.00, Source::AlphaVantage);
        let err = merge(&[a], &[b], &opts(ConflictPolicy::default())).unwrap_err();
        assert!(matches!(err, MergeError::ConflictingDuplicate { .. }));
    }

    #[test]
    fn out_of_scope_records_are_dropped() {
        let av = vec![
            clean("AAPL", "2023-12-29", 192.53, Source::AlphaVantage),
            clean("TSLA", "2024-01-02", 248.42, Source::AlphaVantage),
            clean("AAPL", "2024-01-02", 185.64, Source::AlphaVantage),
        ];
        let out = merge(&av, &[], &opts(ConflictPolicy::default())).unwrap();
        assert_eq!(out.report.out_of_scope_dropped, 2);
        assert_eq!(out.records.len(), 1);
    }

    #[test]
    fn output_sorted_by_date_then_symbol() {
        let av = vec![
            clean("MSFT", "2024-01-03", 1.0, Source::AlphaVantage),
            clean("MSFT", "2024-01-02", 1.0, Source::AlphaVantage),
            clean("AAPL", "2024-01-03", 1.0, Source::AlphaVantage),
        ];
        let out = merge(&av, &[], &opts(ConflictPolicy::default())).unwrap();
        let keys: Vec<(NaiveDate, &str)> =
            out.records.iter().map(|r| (r.date, r.symbol.as_str())).collect();
        assert_eq!(
            keys,
            vec![
                (d("2024-01-02"), "MSFT"),
                (d("2024-01-03"), "AAPL"),
                (d("2024-01-03"), "MSFT"),
            ]
        );
    }

    #[test]
    fn discrepancies_over_threshold_only() {
        let av = vec![
            clean("AAPL", "2024-01-02", 100.0, Source::AlphaVantage),
            clean("MSFT", "2024-01-02", 100.0, Source::AlphaVantage),
        ];
        let yf = vec![
            clean("AAPL", "2024-01-02", 104.0, Source::YahooFinance),
            clean("MSFT", "2024-01-02", 94.0, Source::YahooFinance),
        ];
        let found = find_discrepancies(&av, &yf, 5.0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].symbol, "MSFT");
    }
}
