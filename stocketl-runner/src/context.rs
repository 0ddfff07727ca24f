//! Per-run context: the run date, its window and its staging directory.
//!
//! Each dated run stages into `{staging_root}/{run_date}/`, so runs for
//! different dates never share files.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use stocketl_core::domain::{DateWindow, Source};

use crate::config::PipelineConfig;

pub const MERGED_FILE: &str = "merged_stock_data.csv";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const OBJECT_PREFIX: &str = "stock_data";

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_date: NaiveDate,
    pub window: DateWindow,
    pub staging_dir: PathBuf,
}

impl RunContext {
    pub fn new(config: &PipelineConfig, run_date: NaiveDate) -> Self {
        Self {
            run_date,
            window: config.window_for(run_date),
            staging_dir: config.staging.root.join(run_date.to_string()),
        }
    }

    pub fn raw_path(&self, source: Source) -> PathBuf {
        self.staging_dir.join(format!("{source}_raw.csv"))
    }

    pub fn clean_path(&self, source: Source) -> PathBuf {
        self.staging_dir.join(format!("{source}_clean.csv"))
    }

    pub fn merged_path(&self) -> PathBuf {
        self.staging_dir.join(MERGED_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.staging_dir.join(MANIFEST_FILE)
    }

    /// Object key of the merged dataset for this run date.
    pub fn object_key(&self) -> String {
        format!("{OBJECT_PREFIX}/{}/{MERGED_FILE}", self.run_date)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }
}
