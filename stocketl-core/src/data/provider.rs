//! Data provider trait and structured error types.
//!
//! The DataProvider trait abstracts over the two upstream APIs (Alpha Vantage,
//! Yahoo Finance) so the extract step can be driven by mocks in tests.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Source;

/// Daily OHLCV bar as returned by a provider, before it is tagged and staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Structured error types for extraction.
///
/// Every variant fails the extract step; none of them is downgraded to a
/// skipped symbol.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("hard stop: {provider} has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped { provider: String },

    #[error("HTTP {status} from {provider} for {symbol}")]
    Http {
        provider: String,
        symbol: String,
        status: u16,
    },

    #[error("{provider} returned no bars for '{symbol}' between {start} and {end}")]
    EmptyWindow {
        provider: String,
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
    },

    #[error("{provider} returned more than one bar for '{symbol}' on {date}")]
    DuplicateBar {
        provider: String,
        symbol: String,
        date: NaiveDate,
    },

    #[error(
        "{provider} returned no bar for '{symbol}' on {missing} trading day(s) other symbols have (first {first})"
    )]
    MissingTradingDays {
        provider: String,
        symbol: String,
        missing: usize,
        first: NaiveDate,
    },

    #[error("data error: {0}")]
    Other(String),
}

/// Result of a successful data fetch for a single symbol.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub symbol: String,
    pub bars: Vec<RawBar>,
    pub source: Source,
}

/// Trait for upstream price APIs.
///
/// Implementations handle the specifics of one API. Staging and validation
/// sit above this trait; providers never touch the filesystem.
pub trait DataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Source tag stamped on every record this provider yields.
    fn source(&self) -> Source;

    /// Fetch daily OHLCV bars for a symbol over an inclusive date range,
    /// sorted by date ascending.
    fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate)
        -> Result<FetchResult, DataError>;

    /// Check if the provider is currently available (not rate-limited, not blocked).
    fn is_available(&self) -> bool;
}
