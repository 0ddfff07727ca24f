//! Alpha Vantage data provider.
//!
//! Fetches `TIME_SERIES_DAILY` over blocking HTTP. Alpha Vantage reports most
//! failures inside a 200 response (`Error Message`, `Note`, `Information`), so
//! the body is inspected before the time series is trusted.
//!
//! The free tier allows 5 calls per minute; requests are spaced by
//! `min_interval` (12 s by default). `outputsize=full` is premium-only: a
//! free key only ever requests `compact`, and a window older than `compact`
//! covers fails before any call is spent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Deserialize;

use super::circuit_breaker::CircuitBreaker;
use super::provider::{DataError, DataProvider, FetchResult, RawBar};
use crate::domain::Source;

pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";

/// `compact` returns the latest 100 trading days, roughly 140 calendar days.
const COMPACT_CALENDAR_DAYS: i64 = 140;

#[derive(Debug, Deserialize)]
struct TimeSeriesResponse {
    #[serde(rename = "Time Series (Daily)")]
    time_series: Option<BTreeMap<String, DailyQuote>>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DailyQuote {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

pub struct AlphaVantageProvider {
    client: reqwest::blocking::Client,
    api_key: String,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    max_retries: u32,
    premium: bool,
}

impl AlphaVantageProvider {
    pub fn new(
        api_key: impl Into<String>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(DataError::AuthenticationRequired(
                "Alpha Vantage API key is empty".into(),
            ));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            circuit_breaker,
            min_interval: Duration::from_secs(12),
            last_request: Mutex::new(None),
            max_retries: 2,
            premium: false,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Premium keys may request `outputsize=full`.
    pub fn with_premium(mut self, premium: bool) -> Self {
        self.premium = premium;
        self
    }

    /// `outputsize_for`, refusing `full` on a free key.
    fn outputsize(&self, start: NaiveDate, today: NaiveDate) -> Result<&'static str, DataError> {
        match Self::outputsize_for(start, today) {
            "full" if !self.premium => Err(DataError::AuthenticationRequired(format!(
                "a fetch starting {start} needs outputsize=full, which requires a premium \
                 Alpha Vantage key (set alpha_vantage.premium = true or shorten the window)"
            ))),
            size => Ok(size),
        }
    }

    /// `full` only when the window reaches further back than `compact` covers.
    pub fn outputsize_for(start: NaiveDate, today: NaiveDate) -> &'static str {
        if (today - start).num_days() > COMPACT_CALENDAR_DAYS {
            "full"
        } else {
            "compact"
        }
    }

    fn query_url(&self, symbol: &str, outputsize: &str) -> Result<reqwest::Url, DataError> {
        reqwest::Url::parse_with_params(
            &self.base_url,
            &[
                ("function", "TIME_SERIES_DAILY"),
                ("symbol", symbol),
                ("outputsize", outputsize),
                ("apikey", self.api_key.as_str()),
            ],
        )
        .map_err(|e| DataError::Other(format!("invalid Alpha Vantage base URL: {e}")))
    }

    /// Sleep until `min_interval` has passed since the previous request.
    fn throttle(&self) {
        let mut last = self.last_request.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                tracing::debug!(?wait, "throttling Alpha Vantage request");
                std::thread::sleep(wait);
            }
        }
        *last = Some(Instant::now());
    }

    fn check_api_error(&self, symbol: &str, resp: &TimeSeriesResponse) -> Result<(), DataError> {
        if let Some(msg) = &resp.error_message {
            if msg.contains("Invalid API call") || msg.contains("not found") {
                return Err(DataError::SymbolNotFound {
                    symbol: symbol.to_string(),
                });
            }
            return Err(DataError::Other(format!("Alpha Vantage: {msg}")));
        }

        for msg in [&resp.note, &resp.information].into_iter().flatten() {
            if is_rate_limit_message(msg) {
                return Err(DataError::RateLimited {
                    provider: self.name().to_string(),
                });
            }
            if msg.contains("premium") || msg.contains("apikey") {
                return Err(DataError::AuthenticationRequired(msg.clone()));
            }
            tracing::warn!(symbol, message = %msg, "Alpha Vantage notice");
        }
        Ok(())
    }

    /// Parse a `TIME_SERIES_DAILY` body into bars sorted by date.
    pub fn parse_response(&self, symbol: &str, body: &str) -> Result<Vec<RawBar>, DataError> {
        let resp: TimeSeriesResponse = serde_json::from_str(body).map_err(|e| {
            DataError::ResponseFormatChanged(format!("failed to parse response for {symbol}: {e}"))
        })?;
        self.check_api_error(symbol, &resp)?;

        let series = resp.time_series.ok_or_else(|| {
            DataError::ResponseFormatChanged("missing 'Time Series (Daily)'".into())
        })?;

        // BTreeMap keys are ISO dates, so iteration order is already chronological.
        series
            .iter()
            .map(|(date, q)| {
                let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                    DataError::ResponseFormatChanged(format!("invalid date key '{date}'"))
                })?;
                Ok(RawBar {
                    date,
                    open: parse_price(&q.open, "open")?,
                    high: parse_price(&q.high, "high")?,
                    low: parse_price(&q.low, "low")?,
                    close: parse_price(&q.close, "close")?,
                    volume: q.volume.trim().parse::<u64>().map_err(|_| {
                        DataError::ResponseFormatChanged(format!("invalid volume '{}'", q.volume))
                    })?,
                })
            })
            .collect()
    }

    fn fetch_with_retry(&self, symbol: &str, outputsize: &str) -> Result<Vec<RawBar>, DataError> {
        let tripped = || DataError::CircuitBreakerTripped {
            provider: self.name().to_string(),
        };
        let url = self.query_url(symbol, outputsize)?;
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if !self.circuit_breaker.is_allowed() {
                return Err(tripped());
            }
            self.throttle();
            tracing::debug!(symbol, outputsize, attempt, "requesting Alpha Vantage daily series");

            // reqwest errors carry the URL, which contains the key.
            let resp = match self.client.get(url.clone()).send() {
                Ok(resp) => resp,
                Err(e) => {
                    let e = e.without_url();
                    if e.is_connect() || e.is_timeout() {
                        last_error = Some(DataError::NetworkUnreachable(e.to_string()));
                        continue;
                    }
                    return Err(DataError::NetworkUnreachable(e.to_string()));
                }
            };

            let status = resp.status();
            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(tripped());
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                last_error = Some(DataError::RateLimited {
                    provider: self.name().to_string(),
                });
                continue;
            }
            if !status.is_success() {
                self.circuit_breaker.record_failure();
                last_error = Some(DataError::Http {
                    provider: self.name().to_string(),
                    symbol: symbol.to_string(),
                    status: status.as_u16(),
                });
                continue;
            }

            let body = resp
                .text()
                .map_err(|e| DataError::NetworkUnreachable(e.without_url().to_string()))?;
            match self.parse_response(symbol, &body) {
                Ok(bars) => {
                    self.circuit_breaker.record_success();
                    return Ok(bars);
                }
                Err(e @ DataError::RateLimited { .. }) => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }
}

fn is_rate_limit_message(msg: &str) -> bool {
    msg.contains("API call frequency") || msg.contains("rate limit")
}

fn parse_price(value: &str, field: &str) -> Result<f64, DataError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| DataError::ResponseFormatChanged(format!("invalid {field} '{value}'")))
}

impl DataProvider for AlphaVantageProvider {
    fn name(&self) -> &str {
        "alpha_vantage"
    }

    fn source(&self) -> Source {
        Source::AlphaVantage
    }

    fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchResult, DataError> {
        let outputsize = self.outputsize(start, chrono::Utc::now().date_naive())?;
        let bars = self
            .fetch_with_retry(symbol, outputsize)?
            .into_iter()
            .filter(|b| b.date >= start && b.date <= end)
            .collect();
        Ok(FetchResult {
            symbol: symbol.to_string(),
            bars,
            source: Source::AlphaVantage,
        })
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
