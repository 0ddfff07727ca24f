//! Record types flowing through the pipeline.
//!
//! - `RawRecord`: one extracted daily bar, as staged by an extractor.
//! - `CleanRecord`: a raw record plus derived metrics, one per (symbol, date, source).
//! - `MergedRecord`: one row per (symbol, date) after cross-source resolution.
//!   Field order matches the warehouse column order.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::source::{MergedSource, Source};

/// Daily OHLCV bar for one symbol from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub source: Source,
    pub extracted_at: DateTime<Utc>,
}

impl RawRecord {
    /// True when every price is finite, positive and the bar is internally consistent.
    pub fn is_sane(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }
}

/// Raw record plus derived metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// `close[t] - close[t-1]`; `None` for the first bar of a series.
    pub daily_change: Option<f64>,
    /// Rolling sample standard deviation of close; `None` until the window fills.
    pub volatility: Option<f64>,
    pub source: Source,
    pub extracted_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl CleanRecord {
    /// Compares market values only, ignoring extraction/processing timestamps.
    pub fn same_values(&self, other: &CleanRecord) -> bool {
        self.symbol == other.symbol
            && self.date == other.date
            && self.source == other.source
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
            && self.daily_change == other.daily_change
            && self.volatility == other.volatility
    }
}

/// Warehouse row: one per (symbol, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub daily_change: Option<f64>,
    pub volatility: Option<f64>,
    pub source: MergedSource,
}

impl From<&CleanRecord> for MergedRecord {
    fn from(r: &CleanRecord) -> Self {
        Self {
            symbol: r.symbol.clone(),
            date: r.date,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
            daily_change: r.daily_change,
            volatility: r.volatility,
            source: r.source.into(),
        }
    }
}

/// Parse the date formats the two providers (and older staging files) produce.
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD HH:MM:SS+HH:MM`
/// and RFC 3339. Offset-carrying timestamps keep their local calendar date,
/// which is the exchange trading date.
pub fn normalize_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }
    NaiveDate::parse_from_str(value, "%Y%m%d").ok()
}
