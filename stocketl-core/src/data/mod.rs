//! Upstream price APIs.

pub mod alpha_vantage;
pub mod circuit_breaker;
pub mod provider;
pub mod yahoo;

pub use alpha_vantage::AlphaVantageProvider;
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use provider::{DataError, DataProvider, FetchResult, RawBar};
pub use yahoo::YahooProvider;
