//! Property tests for transform and merge invariants.
//!
//! Uses proptest to verify:
//! 1. Transform output is inside the window, sorted, and unique per (symbol, date)
//! 2. daily_change always equals the close difference to the previous bar
//! 3. Merged output is unique per (symbol, date) and sorted by (date, symbol)
//! 4. Merging identical single-source datasets resolves zero conflicts

use chrono::{Duration, NaiveDate, Utc};
use proptest::prelude::*;
use std::collections::HashSet;
use stocketl_core::domain::{CleanRecord, DateWindow, RawRecord, Source};
use stocketl_core::merge::{merge, ConflictPolicy, MergeOptions};
use stocketl_core::transform::{transform, TransformOptions};

const SYMBOLS: [&str; 3] = ["AAPL", "MSFT", "GOOGL"];

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_close() -> impl Strategy<Value = f64> {
    (10.0..500.0_f64).prop_map(|p| (p * 100.0).round() / 100.0)
}

/// One series: a set of distinct day offsets with a close per day.
fn arb_series() -> impl Strategy<Value = Vec<(i64, f64)>> {
    prop::collection::btree_map(0..60_i64, arb_close(), 1..40)
        .prop_map(|m| m.into_iter().collect())
}

fn arb_dataset(source: Source) -> impl Strategy<Value = Vec<RawRecord>> {
    prop::collection::vec(arb_series(), SYMBOLS.len()).prop_map(move |all| {
        let mut out = Vec::new();
        for (symbol, series) in SYMBOLS.iter().zip(all) {
            for (offset, close) in series {
                out.push(RawRecord {
                    symbol: symbol.to_string(),
                    date: base_date() + Duration::days(offset),
                    open: close,
                    high: close * 1.01,
                    low: close * 0.99,
                    close,
                    volume: 1_000_000,
                    source,
                    extracted_at: Utc::now(),
                });
            }
        }
        // Input order must not matter.
        out.reverse();
        out
    })
}

fn arb_window() -> impl Strategy<Value = DateWindow> {
    (0..60_i64, 0..30_i64).prop_map(|(start, len)| {
        let start = base_date() + Duration::days(start);
        DateWindow::new(start, start + Duration::days(len)).unwrap()
    })
}

fn transform_opts(window: DateWindow, vol: usize) -> TransformOptions {
    TransformOptions {
        window,
        volatility_window: vol,
        processed_at: Utc::now(),
    }
}

fn merge_opts(window: DateWindow, policy: ConflictPolicy) -> MergeOptions {
    let mut opts = MergeOptions::new(window, SYMBOLS.iter().map(|s| s.to_string()).collect());
    opts.policy = policy;
    opts
}

fn arb_policy() -> impl Strategy<Value = ConflictPolicy> {
    prop_oneof![
        Just(ConflictPolicy::Prefer(Source::AlphaVantage)),
        Just(ConflictPolicy::Prefer(Source::YahooFinance)),
        Just(ConflictPolicy::Average),
    ]
}

// ── 1-2. Transform ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn transform_output_is_windowed_sorted_unique(
        raw in arb_dataset(Source::AlphaVantage),
        window in arb_window(),
        vol in 2..10_usize,
    ) {
        let clean = transform(&raw, &transform_opts(window, vol)).unwrap();
        prop_assert!(clean.iter().all(|r| window.contains(r.date)));
        prop_assert!(clean.windows(2).all(|w| (&w[0].symbol, w[0].date) < (&w[1].symbol, w[1].date)));
        prop_assert!(clean.iter().all(|r| r.volatility.map_or(true, |v| v >= 0.0)));

        let in_window = raw.iter().filter(|r| window.contains(r.date)).count();
        prop_assert_eq!(clean.len(), in_window);
    }

    #[test]
    fn daily_change_matches_previous_close(raw in arb_dataset(Source::YahooFinance)) {
        let all = DateWindow::new(base_date(), base_date() + Duration::days(60)).unwrap();
        let clean = transform(&raw, &transform_opts(all, 5)).unwrap();
        for w in clean.windows(2) {
            if w[0].symbol == w[1].symbol {
                let expected = w[1].close - w[0].close;
                prop_assert!((w[1].daily_change.unwrap() - expected).abs() < 1e-9);
            } else {
                prop_assert!(w[1].daily_change.is_none());
            }
        }
        prop_assert!(clean[0].daily_change.is_none());
    }
}

// ── 3-4. Merge ───────────────────────────────────────────────────────

fn clean_of(raw: &[RawRecord], window: DateWindow) -> Vec<CleanRecord> {
    transform(raw, &transform_opts(window, 3)).unwrap()
}

proptest! {
    #[test]
    fn merged_output_is_unique_and_ordered(
        av in arb_dataset(Source::AlphaVantage),
        yf in arb_dataset(Source::YahooFinance),
        window in arb_window(),
        policy in arb_policy(),
    ) {
        let left = clean_of(&av, window);
        let right = clean_of(&yf, window);
        let out = merge(&left, &right, &merge_opts(window, policy)).unwrap();

        let mut keys = HashSet::new();
        for r in &out.records {
            prop_assert!(keys.insert((r.symbol.clone(), r.date)));
            prop_assert!(window.contains(r.date));
        }
        prop_assert!(out.records.windows(2).all(|w| (w[0].date, &w[0].symbol) < (w[1].date, &w[1].symbol)));

        let expected: HashSet<_> = left.iter().chain(&right).map(|r| (r.symbol.clone(), r.date)).collect();
        prop_assert_eq!(keys, expected);
        prop_assert_eq!(out.report.merged_records, out.records.len());
        prop_assert_eq!(
            out.report.conflicts_resolved,
            left.len() + right.len() - out.records.len()
        );
    }

    #[test]
    fn identical_single_source_merge_has_no_conflicts(
        av in arb_dataset(Source::AlphaVantage),
        window in arb_window(),
    ) {
        let clean = clean_of(&av, window);
        let out = merge(&clean, &clean, &merge_opts(window, ConflictPolicy::default())).unwrap();
        prop_assert_eq!(out.report.conflicts_resolved, 0);
        prop_assert_eq!(out.report.duplicates_dropped, clean.len());
        prop_assert_eq!(out.records.len(), clean.len());
    }
}
