//! The eight pipeline steps and their orchestration.
//!
//! Steps communicate only through files in the run's staging directory (and the
//! uploaded object), so any single step can be re-run on its own once its
//! inputs exist. `run_all` executes them in order and stops at the first
//! failure; every attempt is recorded in the run manifest.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stocketl_core::data::{AlphaVantageProvider, CircuitBreaker, DataError, DataProvider, YahooProvider};
use stocketl_core::domain::{CleanRecord, Source};
use stocketl_core::merge::{merge, MergeError, MergeOptions};
use stocketl_core::staging::{self, StagingError};
use stocketl_core::transform::{transform, warmup_calendar_days, TransformError, TransformOptions};
use stocketl_core::validate::{
    validate_merged_file, validate_raw_file, RawRules, TransformedRules, ValidationReport,
};

use crate::auth::{AuthError, EnvTokenSource, MetadataServerTokenSource, ServiceAccount, TokenSource};
use crate::config::{PipelineConfig, StorageBackend, TokenSourceKind, WarehouseBackend};
use crate::context::RunContext;
use crate::extract::extract_source;
use crate::manifest::{ManifestError, RunManifest, RunStatus, StepOutput, StepRecord, StepStatus};
use crate::storage::{
    content_hash, upload_if_changed, GcsObjectStore, LocalObjectStore, ObjectStore, StorageError,
};
use crate::warehouse::{load_idempotent, BigQueryWarehouse, LocalWarehouse, Warehouse, WarehouseError};

/// Violations listed in a validation failure message.
const VIOLATION_SUMMARY_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    ExtractAlphaVantage,
    ExtractYahooFinance,
    ValidateRaw,
    Transform,
    Merge,
    ValidateTransformed,
    Upload,
    Load,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::ExtractAlphaVantage,
        Step::ExtractYahooFinance,
        Step::ValidateRaw,
        Step::Transform,
        Step::Merge,
        Step::ValidateTransformed,
        Step::Upload,
        Step::Load,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ExtractAlphaVantage => "extract-alpha-vantage",
            Step::ExtractYahooFinance => "extract-yahoo-finance",
            Step::ValidateRaw => "validate-raw",
            Step::Transform => "transform",
            Step::Merge => "merge",
            Step::ValidateTransformed => "validate-transformed",
            Step::Upload => "upload",
            Step::Load => "load",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Step::ExtractAlphaVantage => "fetch daily prices from Alpha Vantage into staging",
            Step::ExtractYahooFinance => "fetch daily prices from Yahoo Finance into staging",
            Step::ValidateRaw => "check both raw staging files",
            Step::Transform => "compute daily change and volatility per source",
            Step::Merge => "combine both sources into one row per symbol and date",
            Step::ValidateTransformed => "check the merged file against the warehouse schema",
            Step::Upload => "write the merged file to object storage",
            Step::Load => "append new date partitions to the warehouse",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Step::ExtractAlphaVantage | Step::ExtractYahooFinance => ErrorClass::Extraction,
            Step::ValidateRaw | Step::ValidateTransformed => ErrorClass::Validation,
            Step::Transform | Step::Merge => ErrorClass::Transformation,
            Step::Upload | Step::Load => ErrorClass::Load,
        }
    }

    fn extract_for(source: Source) -> Step {
        match source {
            Source::AlphaVantage => Step::ExtractAlphaVantage,
            Source::YahooFinance => Step::ExtractYahooFinance,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "unknown step '{name}' (expected one of: {all})",
    name = .0,
    all = Step::ALL.map(|s| s.as_str()).join(", ")
)]
pub struct UnknownStep(pub String);

impl FromStr for Step {
    type Err = UnknownStep;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('_', "-");
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == wanted)
            .ok_or_else(|| UnknownStep(s.to_string()))
    }
}

/// Failure taxonomy used for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Extraction,
    Validation,
    Transformation,
    Load,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorClass::Extraction => "extraction",
            ErrorClass::Validation => "validation",
            ErrorClass::Transformation => "transformation",
            ErrorClass::Load => "load",
        })
    }
}

#[derive(Debug, Error)]
pub enum StepErrorKind {
    #[error(transparent)]
    Extraction(#[from] DataError),

    #[error("validation failed\n{0}")]
    Validation(String),

    #[error(transparent)]
    Transformation(#[from] TransformError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("missing input {}: run step '{producer}' first", path.display())]
    MissingInput { path: PathBuf, producer: Step },

    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Error)]
#[error("step '{step}' failed ({}): {kind}", step.class())]
pub struct StepError {
    pub step: Step,
    #[source]
    pub kind: StepErrorKind,
}

impl StepError {
    pub fn class(&self) -> ErrorClass {
        self.step.class()
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("provider setup failed: {0}")]
    Provider(#[from] DataError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

/// The external systems a pipeline talks to.
pub struct PipelineServices {
    /// `None` when no API key is configured; the extractor step then fails.
    pub alpha_vantage: Option<Box<dyn DataProvider>>,
    pub yahoo: Box<dyn DataProvider>,
    pub store: Box<dyn ObjectStore>,
    pub warehouse: Box<dyn Warehouse>,
}

impl PipelineServices {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let cb = &config.circuit_breaker;
        let breaker = |label: &str| {
            Arc::new(
                CircuitBreaker::new(label, Duration::from_secs(cb.cooldown_secs))
                    .with_failure_threshold(cb.failure_threshold),
            )
        };

        let yahoo = YahooProvider::new(breaker("yahoo_finance"))?
            .with_base_url(config.yahoo.base_url.clone())
            .with_retries(
                config.yahoo.max_retries,
                Duration::from_millis(config.yahoo.base_delay_ms),
            );

        let av = &config.alpha_vantage;
        let alpha_vantage: Option<Box<dyn DataProvider>> =
            match av.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
                Some(key) => Some(Box::new(
                    AlphaVantageProvider::new(key, breaker("alpha_vantage"))?
                        .with_base_url(av.base_url.clone())
                        .with_min_interval(Duration::from_secs(av.min_interval_secs))
                        .with_max_retries(av.max_retries)
                        .with_premium(av.premium),
                ) as Box<dyn DataProvider>),
                None => {
                    tracing::warn!("alpha_vantage_api_key is not set; Alpha Vantage extraction will fail");
                    None
                }
            };

        let store: Box<dyn ObjectStore> = match config.storage.backend {
            StorageBackend::Local => Box::new(LocalObjectStore::new(
                &config.storage.local_root,
                config.storage.bucket.clone(),
            )),
            StorageBackend::Gcs => Box::new(
                GcsObjectStore::new(config.storage.bucket.clone(), token_source(config)?)?
                    .with_base_url(config.storage.gcs_base_url.clone()),
            ),
        };

        let wh = &config.warehouse;
        let warehouse: Box<dyn Warehouse> = match wh.backend {
            WarehouseBackend::Local => Box::new(LocalWarehouse::new(
                &wh.local_root,
                wh.dataset.clone(),
                wh.table.clone(),
            )),
            WarehouseBackend::Bigquery => {
                let project = match &wh.project {
                    Some(p) => p.clone(),
                    None => {
                        let sa = ServiceAccount::from_file(&config.credentials.service_account_path)?;
                        tracing::debug!(client_email = %sa.client_email, "using service account project");
                        sa.project_id
                    }
                };
                Box::new(
                    BigQueryWarehouse::new(project, wh.dataset.clone(), wh.table.clone(), token_source(config)?)?
                        .with_base_url(wh.bigquery_base_url.clone()),
                )
            }
        };

        Ok(Self {
            alpha_vantage,
            yahoo: Box::new(yahoo),
            store,
            warehouse,
        })
    }

    fn provider(&self, source: Source) -> Result<&dyn DataProvider, StepErrorKind> {
        match source {
            Source::YahooFinance => Ok(self.yahoo.as_ref()),
            Source::AlphaVantage => self.alpha_vantage.as_deref().ok_or_else(|| {
                StepErrorKind::Config(
                    "Alpha Vantage API key is not configured (variable 'alpha_vantage_api_key')".into(),
                )
            }),
        }
    }
}

fn token_source(config: &PipelineConfig) -> Result<Arc<dyn TokenSource>, AuthError> {
    Ok(match config.credentials.token_source {
        TokenSourceKind::Metadata => Arc::new(MetadataServerTokenSource::new()?),
        TokenSourceKind::Env => Arc::new(EnvTokenSource),
    })
}

pub struct Pipeline {
    config: PipelineConfig,
    services: PipelineServices,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, services: PipelineServices) -> Self {
        Self { config, services }
    }

    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let services = PipelineServices::from_config(&config)?;
        Ok(Self::new(config, services))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    pub fn context(&self, run_date: NaiveDate) -> RunContext {
        RunContext::new(&self.config, run_date)
    }

    /// Every step in order; stops at the first failure.
    pub fn run_all(&self, run_date: NaiveDate) -> Result<RunManifest, PipelineError> {
        let ctx = self.context(run_date);
        let mut manifest = RunManifest::new(run_date, ctx.window, self.config.pipeline.symbols.clone());
        tracing::info!(run_date = %run_date, window = %ctx.window, symbols = manifest.symbols.len(), "pipeline run started");

        for step in Step::ALL {
            let (record, result) = self.timed(step, &ctx);
            manifest.record(record);
            if let Err(err) = result {
                manifest.finish(RunStatus::Failed);
                if let Err(e) = manifest.save(&ctx.manifest_path()) {
                    tracing::error!(error = %e, "could not write run manifest");
                }
                return Err(err.into());
            }
            manifest.save(&ctx.manifest_path())?;
        }

        manifest.finish(RunStatus::Succeeded);
        manifest.save(&ctx.manifest_path())?;
        tracing::info!(run_date = %run_date, "pipeline run succeeded");
        Ok(manifest)
    }

    /// One step against the run's existing staging files.
    pub fn run_step(&self, step: Step, run_date: NaiveDate) -> Result<StepRecord, PipelineError> {
        let ctx = self.context(run_date);
        let path = ctx.manifest_path();
        let mut manifest = RunManifest::load(&path)?.unwrap_or_else(|| {
            RunManifest::new(run_date, ctx.window, self.config.pipeline.symbols.clone())
        });

        let (record, result) = self.timed(step, &ctx);
        manifest.record(record.clone());
        let all_done = Step::ALL.iter().all(|s| {
            manifest
                .step(*s)
                .is_some_and(|r| r.status == StepStatus::Succeeded)
        });
        if result.is_err() {
            manifest.finish(RunStatus::Failed);
        } else if all_done {
            manifest.finish(RunStatus::Succeeded);
        } else {
            manifest.status = RunStatus::Running;
            manifest.finished_at = None;
        }
        manifest.save(&path)?;

        result?;
        Ok(record)
    }

    fn timed(&self, step: Step, ctx: &RunContext) -> (StepRecord, Result<(), StepError>) {
        let _span = tracing::info_span!("step", step = %step, run_date = %ctx.run_date).entered();
        tracing::info!("{}", step.description());
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = self.execute(step, ctx);
        let duration_ms = clock.elapsed().as_millis() as u64;

        let (status, error, output, result) = match result {
            Ok(output) => {
                tracing::info!(records = output.records, warnings = output.warnings.len(), duration_ms, "step succeeded");
                (StepStatus::Succeeded, None, output, Ok(()))
            }
            Err(kind) => {
                let err = StepError { step, kind };
                tracing::error!(class = %err.class(), error = %err.kind, duration_ms, "step failed");
                (StepStatus::Failed, Some(err.kind.to_string()), StepOutput::default(), Err(err))
            }
        };

        let record = StepRecord {
            step,
            status,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            error,
            output,
        };
        (record, result)
    }

    fn execute(&self, step: Step, ctx: &RunContext) -> Result<StepOutput, StepErrorKind> {
        match step {
            Step::ExtractAlphaVantage => self.extract(Source::AlphaVantage, ctx),
            Step::ExtractYahooFinance => self.extract(Source::YahooFinance, ctx),
            Step::ValidateRaw => self.validate_raw(ctx),
            Step::Transform => self.transform(ctx),
            Step::Merge => self.merge(ctx),
            Step::ValidateTransformed => self.validate_transformed(ctx),
            Step::Upload => self.upload(ctx),
            Step::Load => self.load(ctx),
        }
    }

    fn extract(&self, source: Source, ctx: &RunContext) -> Result<StepOutput, StepErrorKind> {
        let provider = self.services.provider(source)?;
        let warmup = warmup_calendar_days(self.config.pipeline.volatility_window);
        let (records, summary) = extract_source(
            provider,
            &self.config.pipeline.symbols,
            ctx.window,
            warmup,
            Utc::now(),
        )?;
        staging::write_raw(&ctx.raw_path(source), &records)?;
        Ok(StepOutput {
            records: records.len(),
            extract: Some(summary),
            ..Default::default()
        })
    }

    fn validate_raw(&self, ctx: &RunContext) -> Result<StepOutput, StepErrorKind> {
        let p = &self.config.pipeline;
        let mut output = StepOutput::default();
        let mut failures = Vec::new();

        for source in Source::ALL {
            let path = require(ctx.raw_path(source), Step::extract_for(source))?;
            let mut rules = RawRules::new(p.symbols.clone(), ctx.window, ctx.run_date).for_source(source);
            rules.max_staleness_days = p.max_staleness_days;
            let report = validate_raw_file(&path, &rules)?;
            absorb(&report, &mut output, &mut failures);
        }

        if !failures.is_empty() {
            return Err(StepErrorKind::Validation(failures.join("\n")));
        }
        Ok(output)
    }

    fn transform(&self, ctx: &RunContext) -> Result<StepOutput, StepErrorKind> {
        let opts = TransformOptions {
            window: ctx.window,
            volatility_window: self.config.pipeline.volatility_window,
            processed_at: Utc::now(),
        };
        let mut output = StepOutput::default();
        for source in Source::ALL {
            let raw = staging::read_raw(&require(ctx.raw_path(source), Step::extract_for(source))?)?;
            let clean = transform(&raw, &opts)?;
            tracing::info!(source = %source, raw = raw.len(), clean = clean.len(), "transformed");
            staging::write_clean(&ctx.clean_path(source), &clean)?;
            output.records += clean.len();
        }
        Ok(output)
    }

    fn read_clean_pair(&self, ctx: &RunContext) -> Result<(Vec<CleanRecord>, Vec<CleanRecord>), StepErrorKind> {
        let av = staging::read_clean(&require(ctx.clean_path(Source::AlphaVantage), Step::Transform)?)?;
        let yf = staging::read_clean(&require(ctx.clean_path(Source::YahooFinance), Step::Transform)?)?;
        Ok((av, yf))
    }

    fn merge(&self, ctx: &RunContext) -> Result<StepOutput, StepErrorKind> {
        let p = &self.config.pipeline;
        let (av, yf) = self.read_clean_pair(ctx)?;
        let opts = MergeOptions {
            policy: p.conflict_policy,
            window: ctx.window,
            symbols: p.symbols.clone(),
            discrepancy_threshold_pct: p.discrepancy_threshold_pct,
        };
        let out = merge(&av, &yf, &opts)?;
        staging::write_merged(&ctx.merged_path(), &out.records)?;

        let r = &out.report;
        tracing::info!(
            policy = %opts.policy,
            input = r.input_records,
            merged = r.merged_records,
            conflicts = r.conflicts_resolved,
            duplicates = r.duplicates_dropped,
            out_of_scope = r.out_of_scope_dropped,
            "merged"
        );
        let warnings = r
            .discrepancies
            .iter()
            .map(|d| {
                format!(
                    "{} {}: alpha_vantage close {} vs yahoo_finance close {} ({:.2}%)",
                    d.symbol, d.date, d.alpha_vantage_close, d.yahoo_finance_close, d.pct_diff
                )
            })
            .collect();
        Ok(StepOutput {
            records: out.records.len(),
            warnings,
            merge: Some(out.report),
            ..Default::default()
        })
    }

    fn validate_transformed(&self, ctx: &RunContext) -> Result<StepOutput, StepErrorKind> {
        let p = &self.config.pipeline;
        let merged = require(ctx.merged_path(), Step::Merge)?;
        let (av, yf) = self.read_clean_pair(ctx)?;
        let rules = TransformedRules {
            symbols: p.symbols.clone(),
            window: ctx.window,
            as_of: ctx.run_date,
            max_staleness_days: p.max_staleness_days,
            discrepancy_threshold_pct: p.discrepancy_threshold_pct,
        };
        let report = validate_merged_file(&merged, &rules, Some((av.as_slice(), yf.as_slice())))?;

        let mut output = StepOutput::default();
        let mut failures = Vec::new();
        absorb(&report, &mut output, &mut failures);
        if !failures.is_empty() {
            return Err(StepErrorKind::Validation(failures.join("\n")));
        }
        Ok(output)
    }

    fn upload(&self, ctx: &RunContext) -> Result<StepOutput, StepErrorKind> {
        let path = require(ctx.merged_path(), Step::Merge)?;
        let bytes = std::fs::read(&path).map_err(|source| StagingError::Io {
            path: path.clone(),
            source,
        })?;
        let outcome = upload_if_changed(self.services.store.as_ref(), &ctx.object_key(), &bytes, "text/csv")?;
        let records = staging::read_merged(&path)?.len();
        Ok(StepOutput {
            records,
            upload: Some(outcome),
            ..Default::default()
        })
    }

    fn load(&self, ctx: &RunContext) -> Result<StepOutput, StepErrorKind> {
        let store = self.services.store.as_ref();
        let key = ctx.object_key();
        let bytes = match store.get(&key) {
            Ok(b) => b,
            Err(StorageError::NotFound { bucket, key }) => {
                return Err(StepErrorKind::MissingInput {
                    path: PathBuf::from(format!("{}://{bucket}/{key}", store.name())),
                    producer: Step::Upload,
                })
            }
            Err(e) => return Err(e.into()),
        };
        let origin = format!("{}://{}/{key}", store.name(), store.bucket());
        let rows = staging::read_merged_bytes(&bytes, &origin)?;

        // Same object content, same load id.
        let load_id = format!("{}-{}", ctx.run_date, &content_hash(&bytes)[..12]);
        let summary = load_idempotent(self.services.warehouse.as_ref(), &rows, &load_id)?;
        let warnings = summary
            .partitions_skipped
            .iter()
            .map(|d| format!("partition {d} already loaded; skipped"))
            .chain(
                summary
                    .partitions_completed
                    .iter()
                    .map(|d| format!("partition {d} was partially loaded; appended the missing rows")),
            )
            .collect();
        Ok(StepOutput {
            records: summary.rows_appended,
            warnings,
            load: Some(summary),
            ..Default::default()
        })
    }
}

fn require(path: PathBuf, producer: Step) -> Result<PathBuf, StepErrorKind> {
    if path.exists() {
        Ok(path)
    } else {
        Err(StepErrorKind::MissingInput { path, producer })
    }
}

/// Fold a validation report into the step output; violations go to `failures`.
fn absorb(report: &ValidationReport, output: &mut StepOutput, failures: &mut Vec<String>) {
    report.log();
    output.records += report.metrics.record_count;
    output
        .warnings
        .extend(report.warnings.iter().map(|w| format!("{}: {}", report.dataset, w.message)));
    output.validation.push(report.metrics.clone());
    if !report.passed() {
        failures.push(report.summary(VIOLATION_SUMMARY_LIMIT));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_roundtrip() {
        for step in Step::ALL {
            assert_eq!(step.as_str().parse::<Step>().unwrap(), step);
            assert_eq!(serde_json::to_string(&step).unwrap(), format!("\"{step}\""));
        }
        assert_eq!("validate_raw".parse::<Step>().unwrap(), Step::ValidateRaw);
    }

    #[test]
    fn unknown_step_lists_the_valid_names() {
        let err = "publish".parse::<Step>().unwrap_err();
        assert_eq!(err, UnknownStep("publish".to_string()));
        let msg = err.to_string();
        assert!(msg.starts_with("unknown step 'publish'"));
        assert!(msg.contains("extract-alpha-vantage, extract-yahoo-finance"));
        assert!(msg.ends_with("upload, load)"));
    }

    #[test]
    fn steps_are_ordered() {
        let mut sorted = Step::ALL;
        sorted.sort();
        assert_eq!(sorted, Step::ALL);
    }

    #[test]
    fn error_classes() {
        assert_eq!(Step::ExtractYahooFinance.class(), ErrorClass::Extraction);
        assert_eq!(Step::ValidateTransformed.class(), ErrorClass::Validation);
        assert_eq!(Step::Merge.class(), ErrorClass::Transformation);
        assert_eq!(Step::Upload.class(), ErrorClass::Load);
    }

    #[test]
    fn missing_input_names_the_producer() {
        let err = require(PathBuf::from("/nonexistent/alpha_vantage_clean.csv"), Step::Transform).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("alpha_vantage_clean.csv"));
        assert!(msg.contains("run step 'transform' first"));
    }

    #[test]
    fn local_services_need_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.storage.local_root = dir.path().join("objects");
        config.warehouse.local_root = dir.path().join("warehouse");
        let services = PipelineServices::from_config(&config).unwrap();
        assert!(services.alpha_vantage.is_none());
        assert_eq!(services.store.name(), "file");
        assert_eq!(services.warehouse.name(), "local");
        assert!(matches!(
            services.provider(Source::AlphaVantage),
            Err(StepErrorKind::Config(_))
        ));
    }
}
