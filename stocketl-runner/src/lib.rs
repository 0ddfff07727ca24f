//! StockETL runner: configuration, the eight pipeline steps, object storage
//! and warehouse backends.
//!
//! This crate builds on `stocketl-core` to provide:
//! - Layered configuration (TOML file + external variable store)
//! - Per-run staging directories and run manifests
//! - Extraction orchestration over the core providers
//! - Idempotent upload (local directory or GCS) and load (local Parquet or BigQuery)

pub mod auth;
pub mod config;
pub mod context;
pub mod extract;
pub mod manifest;
pub mod pipeline;
pub mod storage;
pub mod variables;
pub mod warehouse;

pub use config::{ConfigError, PipelineConfig};
pub use context::RunContext;
pub use extract::{extract_source, ExtractSummary};
pub use manifest::{RunManifest, RunStatus, StepOutput, StepRecord, StepStatus};
pub use pipeline::{
    ErrorClass, Pipeline, PipelineError, PipelineServices, Step, StepError, StepErrorKind,
};
pub use storage::{ObjectMeta, ObjectStore, StorageError, UploadOutcome};
pub use variables::{EnvVariableStore, JsonFileVariableStore, VariableStore};
pub use warehouse::{LoadSummary, RowKey, Warehouse, WarehouseError};
