//! Run manifest: `{staging}/{run_date}/manifest.json`.
//!
//! One record per step, replaced when the step is re-run, so the manifest
//! always shows the latest attempt of every step for that run date.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stocketl_core::domain::DateWindow;
use stocketl_core::merge::MergeReport;
use stocketl_core::validate::ValidationMetrics;

use crate::extract::ExtractSummary;
use crate::pipeline::Step;
use crate::storage::UploadOutcome;
use crate::warehouse::LoadSummary;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest {} is malformed: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// What a step produced, beyond success or failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub records: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<ExtractSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub output: StepOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_date: NaiveDate,
    pub window: DateWindow,
    pub symbols: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
}

impl RunManifest {
    pub fn new(run_date: NaiveDate, window: DateWindow, symbols: Vec<String>) -> Self {
        Self {
            run_date,
            window,
            symbols,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            steps: Vec::new(),
        }
    }

    /// `None` when no manifest has been written for this run yet.
    pub fn load(path: &Path) -> Result<Option<Self>, ManifestError> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ManifestError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ManifestError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Replace any earlier record of the same step, keeping pipeline order.
    pub fn record(&mut self, record: StepRecord) {
        self.steps.retain(|r| r.step != record.step);
        self.steps.push(record);
        self.steps.sort_by_key(|r| r.step);
    }

    pub fn step(&self, step: Step) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step == step)
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Write via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let io = |source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ManifestError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io)?;
        fs::rename(&tmp, path).map_err(io)
    }
}
