//! Pipeline configuration.
//!
//! Static settings come from `stocketl.toml`; the variable store overrides the
//! symbols, bucket, dataset, table and the Alpha Vantage key. Every section has
//! defaults, so an empty file is a valid local-development config.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stocketl_core::domain::DateWindow;
use stocketl_core::merge::{ConflictPolicy, DEFAULT_DISCREPANCY_PCT};
use stocketl_core::transform::DEFAULT_VOLATILITY_WINDOW;
use stocketl_core::validate::DEFAULT_MAX_STALENESS_DAYS;

use crate::variables::{StockEtlVariables, VariableError, VariableStore, ALPHA_VANTAGE_API_KEY};

pub const DEFAULT_SYMBOLS: [&str; 4] = ["AAPL", "MSFT", "GOOGL", "AMZN"];
pub const DEFAULT_SERVICE_ACCOUNT_PATH: &str = "/etc/stocketl/service-account.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Variables(#[from] VariableError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub staging: StagingSection,
    pub alpha_vantage: AlphaVantageSection,
    pub yahoo: YahooSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub storage: StorageSection,
    pub warehouse: WarehouseSection,
    pub credentials: CredentialsSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub symbols: Vec<String>,
    /// Window length in calendar days, ending on the run date.
    pub window_days: i64,
    pub volatility_window: usize,
    pub conflict_policy: ConflictPolicy,
    pub discrepancy_threshold_pct: f64,
    /// `None` disables the staleness check.
    pub max_staleness_days: Option<i64>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            window_days: 30,
            volatility_window: DEFAULT_VOLATILITY_WINDOW,
            conflict_policy: ConflictPolicy::default(),
            discrepancy_threshold_pct: DEFAULT_DISCREPANCY_PCT,
            max_staleness_days: Some(DEFAULT_MAX_STALENESS_DAYS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingSection {
    pub root: PathBuf,
}

impl Default for StagingSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("staging"),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlphaVantageSection {
    pub base_url: String,
    /// Usually supplied by the `alpha_vantage_api_key` variable instead.
    pub api_key: Option<String>,
    pub min_interval_secs: u64,
    pub max_retries: u32,
    /// `outputsize=full` is premium-only. Without it, a fetch window (including
    /// warm-up) older than about 140 calendar days fails the extraction.
    pub premium: bool,
}

impl Default for AlphaVantageSection {
    fn default() -> Self {
        Self {
            base_url: stocketl_core::data::alpha_vantage::DEFAULT_BASE_URL.to_string(),
            api_key: None,
            min_interval_secs: 12,
            max_retries: 2,
            premium: false,
        }
    }
}

// Hand-written so the key never reaches a log line.
impl fmt::Debug for AlphaVantageSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlphaVantageSection")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("min_interval_secs", &self.min_interval_secs)
            .field("max_retries", &self.max_retries)
            .field("premium", &self.premium)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YahooSection {
    pub base_url: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for YahooSection {
    fn default() -> Self {
        Self {
            base_url: stocketl_core::data::yahoo::DEFAULT_BASE_URL.to_string(),
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub cooldown_secs: u64,
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            cooldown_secs: 30 * 60,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Local,
    Gcs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: StorageBackend,
    pub bucket: String,
    /// Root directory for the local backend; buckets are subdirectories.
    pub local_root: PathBuf,
    pub gcs_base_url: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            bucket: "stock-data".to_string(),
            local_root: PathBuf::from("data/objects"),
            gcs_base_url: "https://storage.googleapis.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseBackend {
    Local,
    Bigquery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseSection {
    pub backend: WarehouseBackend,
    /// Falls back to the service account's `project_id`.
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
    pub local_root: PathBuf,
    pub bigquery_base_url: String,
}

impl Default for WarehouseSection {
    fn default() -> Self {
        Self {
            backend: WarehouseBackend::Local,
            project: None,
            dataset: "stock_data".to_string(),
            table: "daily_prices".to_string(),
            local_root: PathBuf::from("data/warehouse"),
            bigquery_base_url: "https://bigquery.googleapis.com/bigquery/v2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSourceKind {
    /// GCE / GKE metadata server.
    Metadata,
    /// `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable.
    Env,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsSection {
    pub service_account_path: PathBuf,
    pub token_source: TokenSourceKind,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            service_account_path: PathBuf::from(DEFAULT_SERVICE_ACCOUNT_PATH),
            token_source: TokenSourceKind::Metadata,
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(format!("serialize config: {e}")))
    }

    /// Override file settings with the variable store, then re-validate.
    pub fn apply_variables(&mut self, store: &dyn VariableStore) -> Result<(), ConfigError> {
        if let Some(vars) = StockEtlVariables::from_store(store)? {
            if let Some(symbols) = vars.stock_symbols {
                self.pipeline.symbols = symbols;
            }
            if let Some(bucket) = vars.gcs_bucket {
                self.storage.bucket = bucket;
            }
            if let Some(dataset) = vars.bigquery_dataset {
                self.warehouse.dataset = dataset;
            }
            if let Some(table) = vars.bigquery_table {
                self.warehouse.table = table;
            }
            tracing::debug!(store = store.name(), "applied stock_etl_config variable");
        }
        if let Some(key) = store.get(ALPHA_VANTAGE_API_KEY) {
            self.alpha_vantage.api_key = Some(key);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.symbols.is_empty() {
            return Err(ConfigError::Invalid("pipeline.symbols must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for symbol in &p.symbols {
            if symbol.trim().is_empty() || symbol.trim() != symbol {
                return Err(ConfigError::Invalid(format!("invalid symbol '{symbol}'")));
            }
            if !seen.insert(symbol) {
                return Err(ConfigError::Invalid(format!("symbol '{symbol}' listed twice")));
            }
        }
        if p.window_days < 1 {
            return Err(ConfigError::Invalid("pipeline.window_days must be at least 1".into()));
        }
        if p.volatility_window < 2 {
            return Err(ConfigError::Invalid(
                "pipeline.volatility_window must be at least 2".into(),
            ));
        }
        if !(p.discrepancy_threshold_pct.is_finite() && p.discrepancy_threshold_pct >= 0.0) {
            return Err(ConfigError::Invalid(
                "pipeline.discrepancy_threshold_pct must be a non-negative number".into(),
            ));
        }
        if matches!(p.max_staleness_days, Some(d) if d < 0) {
            return Err(ConfigError::Invalid(
                "pipeline.max_staleness_days must not be negative".into(),
            ));
        }
        for (name, value) in [
            ("storage.bucket", &self.storage.bucket),
            ("warehouse.dataset", &self.warehouse.dataset),
            ("warehouse.table", &self.warehouse.table),
        ] {
            if !is_identifier(value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} '{value}' may only contain letters, digits, '_', '-' and '.'"
                )));
            }
        }
        Ok(())
    }

    /// Extraction window for a run: `window_days` ending on `run_date`.
    pub fn window_for(&self, run_date: NaiveDate) -> DateWindow {
        DateWindow::ending_on(run_date, self.pipeline.window_days)
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{MemoryVariableStore, STOCK_ETL_CONFIG};
    use stocketl_core::domain::Source;

    #[test]
    fn empty_file_uses_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config.pipeline.symbols, vec!["AAPL", "MSFT", "GOOGL", "AMZN"]);
        assert_eq!(config.pipeline.window_days, 30);
        assert_eq!(config.pipeline.volatility_window, 20);
        assert_eq!(
            config.pipeline.conflict_policy,
            ConflictPolicy::Prefer(Source::AlphaVantage)
        );
        assert_eq!(config.storage.backend, StorageBackend::Local);
        assert_eq!(
            config.credentials.service_account_path,
            PathBuf::from("/etc/stocketl/service-account.json")
        );
    }

    #[test]
    fn parses_sections() {
        let config = PipelineConfig::from_toml(
            r#"
            [pipeline]
            symbols = ["AAPL"]
            window_days = 1
            conflict_policy = "average"

            [storage]
            backend = "gcs"
            bucket = "prod-stock-data"

            [warehouse]
            backend = "bigquery"
            project = "acme-analytics"
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.symbols, vec!["AAPL"]);
        assert_eq!(config.pipeline.conflict_policy, ConflictPolicy::Average);
        assert_eq!(config.storage.backend, StorageBackend::Gcs);
        assert_eq!(config.warehouse.backend, WarehouseBackend::Bigquery);
        assert_eq!(config.warehouse.table, "daily_prices");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(PipelineConfig::from_toml("[pipeline]\nsymbols = []").is_err());
        assert!(PipelineConfig::from_toml("[pipeline]\nvolatility_window = 1").is_err());
        assert!(PipelineConfig::from_toml("[pipeline]\nsymbols = [\"A\", \"A\"]").is_err());
        assert!(PipelineConfig::from_toml("[pipeline]\nconflict_policy = \"newest\"").is_err());
        assert!(PipelineConfig::from_toml("[warehouse]\ntable = \"x; DROP\"").is_err());
    }

    #[test]
    fn variables_override_file() {
        let mut config = PipelineConfig::default();
        let store = MemoryVariableStore::new()
            .with(
                STOCK_ETL_CONFIG,
                r#"{"stock_symbols": ["AAPL"], "gcs_bucket": "etl-bucket",
                    "bigquery_dataset": "market", "bigquery_table": "prices"}"#,
            )
            .with(ALPHA_VANTAGE_API_KEY, "secret-key");
        config.apply_variables(&store).unwrap();
        assert_eq!(config.pipeline.symbols, vec!["AAPL"]);
        assert_eq!(config.storage.bucket, "etl-bucket");
        assert_eq!(config.warehouse.dataset, "market");
        assert_eq!(config.warehouse.table, "prices");
        assert_eq!(config.alpha_vantage.api_key.as_deref(), Some("secret-key"));
        assert!(!format!("{config:?}").contains("secret-key"));
    }

    #[test]
    fn window_ends_on_run_date() {
        let config = PipelineConfig::default();
        let run_date = NaiveDate::from_ymd_opt(2024, 1, 30).unwrap();
        let w = config.window_for(run_date);
        assert_eq!(w.end, run_date);
        assert_eq!(w.calendar_days(), 30);
    }

    #[test]
    fn toml_roundtrip() {
        let config = PipelineConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(PipelineConfig::from_toml(&text).unwrap(), config);
    }
}
