//! External key-value variable store.
//!
//! The scheduler environment owns two variables: `stock_etl_config` (JSON with
//! symbols, bucket, dataset and table) and `alpha_vantage_api_key`. Backends
//! read them from the process environment or from a JSON file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const STOCK_ETL_CONFIG: &str = "stock_etl_config";
pub const ALPHA_VANTAGE_API_KEY: &str = "alpha_vantage_api_key";

pub const ENV_PREFIX: &str = "STOCKETL_VAR_";

#[derive(Debug, Error)]
pub enum VariableError {
    #[error("failed to read variables file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("variables file {} is not a JSON object: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("variable '{key}' is not valid JSON: {source}")]
    InvalidJson {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read-only lookup of named variables.
pub trait VariableStore {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Raw text of a variable, `None` when unset.
    fn get(&self, key: &str) -> Option<String>;
}

/// `STOCKETL_VAR_<KEY>` environment variables (key upper-cased).
#[derive(Debug, Clone)]
pub struct EnvVariableStore {
    prefix: String,
}

impl EnvVariableStore {
    pub fn new() -> Self {
        Self::with_prefix(ENV_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn env_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_ascii_uppercase())
    }
}

impl Default for EnvVariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore for EnvVariableStore {
    fn name(&self) -> &str {
        "env"
    }

    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.env_name(key))
            .ok()
            .filter(|v| !v.is_empty())
    }
}

/// JSON object file: `{"stock_etl_config": {...}, "alpha_vantage_api_key": "..."}`.
///
/// String values are returned as-is; any other JSON value is returned as its
/// JSON text, so nested configs survive either way of writing them.
#[derive(Debug, Clone)]
pub struct JsonFileVariableStore {
    path: PathBuf,
    values: BTreeMap<String, serde_json::Value>,
}

impl JsonFileVariableStore {
    pub fn load(path: &Path) -> Result<Self, VariableError> {
        let text = fs::read_to_string(path).map_err(|source| VariableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let values = serde_json::from_str(&text).map_err(|source| VariableError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VariableStore for JsonFileVariableStore {
    fn name(&self) -> &str {
        "json-file"
    }

    fn get(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// In-memory store, mainly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryVariableStore {
    values: BTreeMap<String, String>,
}

impl MemoryVariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl VariableStore for MemoryVariableStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Payload of the `stock_etl_config` variable. Absent fields keep the file config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StockEtlVariables {
    pub stock_symbols: Option<Vec<String>>,
    pub gcs_bucket: Option<String>,
    pub bigquery_dataset: Option<String>,
    pub bigquery_table: Option<String>,
}

impl StockEtlVariables {
    pub fn from_store(store: &dyn VariableStore) -> Result<Option<Self>, VariableError> {
        let Some(text) = store.get(STOCK_ETL_CONFIG) else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| VariableError::InvalidJson {
                key: STOCK_ETL_CONFIG.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_file_returns_nested_objects_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vars.json");
        fs::write(
            &path,
            r#"{"stock_etl_config": {"stock_symbols": ["AAPL"], "gcs_bucket": "b"},
                "alpha_vantage_api_key": "k-123", "unset": null}"#,
        )
        .unwrap();
        let store = JsonFileVariableStore::load(&path).unwrap();
        assert_eq!(store.get(ALPHA_VANTAGE_API_KEY).as_deref(), Some("k-123"));
        assert_eq!(store.get("unset"), None);

        let vars = StockEtlVariables::from_store(&store).unwrap().unwrap();
        assert_eq!(vars.stock_symbols, Some(vec!["AAPL".to_string()]));
        assert_eq!(vars.gcs_bucket.as_deref(), Some("b"));
        assert_eq!(vars.bigquery_table, None);
    }

    #[test]
    fn config_variable_may_be_a_json_string() {
        let store = MemoryVariableStore::new().with(
            STOCK_ETL_CONFIG,
            r#"{"stock_symbols": ["MSFT", "GOOGL"], "bigquery_table": "prices"}"#,
        );
        let vars = StockEtlVariables::from_store(&store).unwrap().unwrap();
        assert_eq!(vars.stock_symbols.unwrap().len(), 2);
        assert_eq!(vars.bigquery_table.as_deref(), Some("prices"));
    }

    #[test]
    fn malformed_config_variable_is_an_error() {
        let store = MemoryVariableStore::new().with(STOCK_ETL_CONFIG, "{not json");
        assert!(matches!(
            StockEtlVariables::from_store(&store),
            Err(VariableError::InvalidJson { .. })
        ));
    }

    #[test]
    fn env_store_uses_prefixed_upper_case_names() {
        let store = EnvVariableStore::with_prefix("STOCKETL_TEST_VARS_");
        assert_eq!(
            store.env_name("alpha_vantage_api_key"),
            "STOCKETL_TEST_VARS_ALPHA_VANTAGE_API_KEY"
        );
        assert_eq!(store.get("definitely_not_set_anywhere"), None);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = JsonFileVariableStore::load(Path::new("/nonexistent/vars.json")).unwrap_err();
        assert!(matches!(err, VariableError::Io { .. }));
    }
}
