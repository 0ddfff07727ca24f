//! Raw → clean transformation.
//!
//! Per (symbol, source) series: sort by date, derive `daily_change` and a
//! rolling `volatility`, then keep only the extraction window. Bars before the
//! window are warm-up history and only feed the derived columns.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::domain::{CleanRecord, DateWindow, RawRecord, Source};

pub const DEFAULT_VOLATILITY_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub window: DateWindow,
    pub volatility_window: usize,
    pub processed_at: DateTime<Utc>,
}

impl TransformOptions {
    pub fn new(window: DateWindow) -> Self {
        Self {
            window,
            volatility_window: DEFAULT_VOLATILITY_WINDOW,
            processed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("duplicate record for {symbol} on {date} from {origin}")]
    DuplicateKey {
        symbol: String,
        date: NaiveDate,
        origin: Source,
    },

    #[error("non-finite close for {symbol} on {date}")]
    NonFinite { symbol: String, date: NaiveDate },

    #[error("volatility window must be at least 2, got {0}")]
    InvalidWindow(usize),
}

/// Calendar days of history to fetch before the window so the first in-window
/// bar has a full volatility window behind it (5 trading days per 7 calendar
/// days, plus slack for holidays).
pub fn warmup_calendar_days(volatility_window: usize) -> i64 {
    (volatility_window as i64) * 7 / 5 + 10
}

/// `close[t] - close[t-1]`, `None` for the first element.
pub fn daily_changes(closes: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(closes.len());
    if closes.is_empty() {
        return out;
    }
    out.push(None);
    out.extend(closes.windows(2).map(|w| Some(w[1] - w[0])));
    out
}

/// Sample standard deviation (n - 1) over each trailing `window` of values.
/// Positions with fewer than `window` values behind them are `None`.
pub fn rolling_std(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window < 2 {
        return vec![None; values.len()];
    }
    (0..values.len())
        .map(|i| {
            if i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            let n = slice.len() as f64;
            let mean = slice.iter().sum::<f64>() / n;
            let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
            Some(var.sqrt())
        })
        .collect()
}

/// Transform one source's raw records into clean records inside `opts.window`,
/// sorted by (symbol, date).
pub fn transform(
    records: &[RawRecord],
    opts: &TransformOptions,
) -> Result<Vec<CleanRecord>, TransformError> {
    if opts.volatility_window < 2 {
        return Err(TransformError::InvalidWindow(opts.volatility_window));
    }

    let mut series: BTreeMap<(&str, Source), Vec<&RawRecord>> = BTreeMap::new();
    for r in records {
        if !r.close.is_finite() {
            return Err(TransformError::NonFinite {
                symbol: r.symbol.clone(),
                date: r.date,
            });
        }
        series.entry((r.symbol.as_str(), r.source)).or_default().push(r);
    }

    let mut out = Vec::new();
    for ((symbol, source), mut bars) in series {
        bars.sort_by_key(|r| r.date);
        if let Some(w) = bars.windows(2).find(|w| w[0].date == w[1].date) {
            return Err(TransformError::DuplicateKey {
                symbol: symbol.to_string(),
                date: w[0].date,
                origin: source,
            });
        }

        let closes: Vec<f64> = bars.iter().map(|r| r.close).collect();
        let changes = daily_changes(&closes);
        let vols = rolling_std(&closes, opts.volatility_window);

        for ((r, change), vol) in bars.iter().zip(changes).zip(vols) {
            if !opts.window.contains(r.date) {
                continue;
            }
            out.push(CleanRecord {
                symbol: r.symbol.clone(),
                date: r.date,
                open: r.open,
                high: r.high,
                low: r.low,
                close: r.close,
                volume: r.volume,
                daily_change: change,
                volatility: vol,
                source: r.source,
                extracted_at: r.extracted_at,
                processed_at: opts.processed_at,
            });
        }
    }

    out.sort_by(|a, b| (&a.symbol, a.date, a.source).cmp(&(&b.symbol, b.date, b.source)));
    tracing::debug!(input = records.len(), output = out.len(), "transformed records");
    Ok(out)
}
