//! Extraction orchestrator: every configured symbol from one provider.
//!
//! No symbol is ever skipped. A provider error, an empty window, a repeated
//! date or a gap fails the whole extraction, so a staged raw file always holds
//! one record per symbol for every trading day in the window.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stocketl_core::data::{DataError, DataProvider};
use stocketl_core::domain::{DateWindow, RawRecord, Source};

/// Summary of one provider's extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractSummary {
    pub source: Source,
    /// Requested range, including warm-up history.
    pub fetch_window: DateWindow,
    pub records: usize,
    pub records_in_window: usize,
    pub per_symbol: BTreeMap<String, usize>,
}

/// Fetch `[window.start - warmup_days, window.end]` for each symbol in order.
///
/// Returns records sorted by (symbol, date), all stamped with `extracted_at`.
pub fn extract_source(
    provider: &dyn DataProvider,
    symbols: &[String],
    window: DateWindow,
    warmup_days: i64,
    extracted_at: DateTime<Utc>,
) -> Result<(Vec<RawRecord>, ExtractSummary), DataError> {
    let fetch_window = window.extend_back(warmup_days);
    let source = provider.source();
    let total = symbols.len();
    let mut records = Vec::new();
    let mut per_symbol = BTreeMap::new();
    let mut records_in_window = 0;
    let mut window_dates: BTreeMap<&str, BTreeSet<NaiveDate>> = BTreeMap::new();

    tracing::info!(
        provider = provider.name(),
        symbols = total,
        window = %window,
        fetch_window = %fetch_window,
        "starting extraction"
    );

    for (i, symbol) in symbols.iter().enumerate() {
        if !provider.is_available() {
            return Err(DataError::CircuitBreakerTripped {
                provider: provider.name().to_string(),
            });
        }

        let fetched = provider
            .fetch(symbol, fetch_window.start, fetch_window.end)
            .map_err(|e| {
                tracing::error!(provider = provider.name(), symbol = %symbol, error = %e, "fetch failed");
                e
            })?;

        let mut dates = HashSet::with_capacity(fetched.bars.len());
        for bar in &fetched.bars {
            if !dates.insert(bar.date) {
                return Err(DataError::DuplicateBar {
                    provider: provider.name().to_string(),
                    symbol: symbol.clone(),
                    date: bar.date,
                });
            }
        }

        let dates_in_window: BTreeSet<NaiveDate> = fetched
            .bars
            .iter()
            .map(|b| b.date)
            .filter(|date| window.contains(*date))
            .collect();
        let in_window = dates_in_window.len();
        if in_window == 0 {
            return Err(DataError::EmptyWindow {
                provider: provider.name().to_string(),
                symbol: symbol.clone(),
                start: window.start,
                end: window.end,
            });
        }

        tracing::info!(
            provider = provider.name(),
            symbol = %symbol,
            progress = format!("{}/{total}", i + 1),
            bars = fetched.bars.len(),
            in_window,
            "fetched"
        );

        records_in_window += in_window;
        window_dates.insert(symbol.as_str(), dates_in_window);
        per_symbol.insert(symbol.clone(), fetched.bars.len());
        records.extend(fetched.bars.into_iter().filter(|b| fetch_window.contains(b.date)).map(|b| {
            RawRecord {
                symbol: symbol.clone(),
                date: b.date,
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                volume: b.volume,
                source,
                extracted_at,
            }
        }));
    }

    check_coverage(provider.name(), &window_dates)?;

    records.sort_by(|a, b| (&a.symbol, a.date).cmp(&(&b.symbol, b.date)));
    let summary = ExtractSummary {
        source,
        fetch_window,
        records: records.len(),
        records_in_window,
        per_symbol,
    };
    Ok((records, summary))
}

/// The union of in-window dates is the provider's trading calendar for this
/// run; a symbol missing any of those days fails the extraction.
fn check_coverage(
    provider: &str,
    window_dates: &BTreeMap<&str, BTreeSet<NaiveDate>>,
) -> Result<(), DataError> {
    let calendar: BTreeSet<NaiveDate> = window_dates.values().flatten().copied().collect();
    for (symbol, dates) in window_dates {
        let missing: Vec<&NaiveDate> = calendar.difference(dates).collect();
        if let Some(first) = missing.first() {
            tracing::error!(provider, symbol, missing = missing.len(), first = %first, "symbol has gaps");
            return Err(DataError::MissingTradingDays {
                provider: provider.to_string(),
                symbol: symbol.to_string(),
                missing: missing.len(),
                first: **first,
            });
        }
    }
    Ok(())
}
