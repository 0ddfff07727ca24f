//! Data source tags carried by every record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upstream API a record was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    AlphaVantage,
    YahooFinance,
}

impl Source {
    /// Both sources, in pipeline order.
    pub const ALL: [Source; 2] = [Source::AlphaVantage, Source::YahooFinance];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::AlphaVantage => "alpha_vantage",
            Source::YahooFinance => "yahoo_finance",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown data source '{0}'")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "alpha_vantage" => Ok(Source::AlphaVantage),
            "yahoo_finance" => Ok(Source::YahooFinance),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// Source tag of a merged record.
///
/// `Blended` marks a record whose values were averaged across both sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergedSource {
    AlphaVantage,
    YahooFinance,
    Blended,
}

impl MergedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergedSource::AlphaVantage => "alpha_vantage",
            MergedSource::YahooFinance => "yahoo_finance",
            MergedSource::Blended => "blended",
        }
    }
}

impl From<Source> for MergedSource {
    fn from(source: Source) -> Self {
        match source {
            Source::AlphaVantage => MergedSource::AlphaVantage,
            Source::YahooFinance => MergedSource::YahooFinance,
        }
    }
}

impl fmt::Display for MergedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergedSource {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "blended" => Ok(MergedSource::Blended),
            other => other.parse::<Source>().map(MergedSource::from),
        }
    }
}
