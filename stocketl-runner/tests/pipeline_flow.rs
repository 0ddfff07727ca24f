//! End-to-end pipeline runs with canned providers and local backends.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;

use stocketl_core::data::{DataError, DataProvider, FetchResult, RawBar};
use stocketl_core::domain::{MergedSource, Source};
use stocketl_core::staging;
use stocketl_runner::config::PipelineConfig;
use stocketl_runner::pipeline::{ErrorClass, Pipeline, PipelineError, PipelineServices, Step, StepErrorKind};
use stocketl_runner::storage::{LocalObjectStore, UploadOutcome};
use stocketl_runner::warehouse::LocalWarehouse;
use stocketl_runner::{RunManifest, RunStatus, StepStatus};

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn bar(date: &str, close: f64) -> RawBar {
    RawBar {
        date: d(date),
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 50_000_000,
    }
}

struct CannedProvider {
    source: Source,
    bars: BTreeMap<String, Vec<RawBar>>,
}

impl CannedProvider {
    fn new(source: Source, bars: &[(&str, Vec<RawBar>)]) -> Self {
        Self {
            source,
            bars: bars.iter().map(|(s, b)| (s.to_string(), b.clone())).collect(),
        }
    }
}

impl DataProvider for CannedProvider {
    fn name(&self) -> &str {
        self.source.as_str()
    }

    fn source(&self) -> Source {
        self.source
    }

    fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<FetchResult, DataError> {
        let bars = self
            .bars
            .get(symbol)
            .ok_or_else(|| DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            })?
            .iter()
            .filter(|b| b.date >= start && b.date <= end)
            .cloned()
            .collect();
        Ok(FetchResult {
            symbol: symbol.to_string(),
            bars,
            source: self.source,
        })
    }

    fn is_available(&self) -> bool {
        true
    }
}

fn aapl_history(last_close: f64) -> Vec<RawBar> {
    vec![
        bar("2023-12-27", 193.15),
        bar("2023-12-28", 193.58),
        bar("2023-12-29", 192.53),
        bar("2024-01-02", last_close),
    ]
}

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.pipeline.symbols = vec!["AAPL".to_string()];
    config.pipeline.window_days = 1;
    config.pipeline.volatility_window = 3;
    config.staging.root = root.join("staging");
    config
}

fn pipeline(root: &Path, av: Option<CannedProvider>, yf: CannedProvider) -> Pipeline {
    let config = config(root);
    let services = PipelineServices {
        alpha_vantage: av.map(|p| Box::new(p) as Box<dyn DataProvider>),
        yahoo: Box::new(yf),
        store: Box::new(LocalObjectStore::new(root.join("objects"), "stock-data")),
        warehouse: Box::new(LocalWarehouse::new(root.join("warehouse"), "stock_data", "daily_prices")),
    };
    Pipeline::new(config, services)
}

fn both_sources(yahoo_close: f64) -> (CannedProvider, CannedProvider) {
    (
        CannedProvider::new(Source::AlphaVantage, &[("AAPL", aapl_history(185.64))]),
        CannedProvider::new(Source::YahooFinance, &[("AAPL", aapl_history(yahoo_close))]),
    )
}

#[test]
fn single_day_run_loads_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let (av, yf) = both_sources(185.64);
    let pipeline = pipeline(dir.path(), Some(av), yf);
    let run_date = d("2024-01-02");

    let manifest = pipeline.run_all(run_date).unwrap();
    assert_eq!(manifest.status, RunStatus::Succeeded);
    assert_eq!(manifest.steps.len(), Step::ALL.len());
    assert!(manifest.steps.iter().all(|s| s.status == StepStatus::Succeeded));

    let ctx = pipeline.context(run_date);
    let merged = staging::read_merged(&ctx.merged_path()).unwrap();
    assert_eq!(merged.len(), 1);
    let row = &merged[0];
    assert_eq!(row.date, run_date);
    assert_eq!(row.source, MergedSource::AlphaVantage);
    let change = row.daily_change.unwrap();
    assert!((change - (185.64 - 192.53)).abs() < 1e-9);
    assert!(row.volatility.is_some());

    let merge = manifest.step(Step::Merge).unwrap();
    assert_eq!(merge.output.merge.as_ref().unwrap().conflicts_resolved, 1);

    let load = manifest.step(Step::Load).unwrap().output.load.clone().unwrap();
    assert_eq!(load.rows_appended, 1);
    assert_eq!(load.partitions_loaded, vec![run_date]);

    let rows = pipeline.services().warehouse.partition_rows(run_date).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].symbol, "AAPL");

    assert!(dir
        .path()
        .join("objects/stock-data/stock_data/2024-01-02/merged_stock_data.csv")
        .exists());
    let saved = RunManifest::load(&ctx.manifest_path()).unwrap().unwrap();
    assert_eq!(saved.status, RunStatus::Succeeded);
}

#[test]
fn rerun_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (av, yf) = both_sources(185.64);
    let pipeline = pipeline(dir.path(), Some(av), yf);
    let run_date = d("2024-01-02");

    pipeline.run_all(run_date).unwrap();
    let second = pipeline.run_all(run_date).unwrap();

    let upload = second.step(Step::Upload).unwrap().output.upload.clone().unwrap();
    assert!(matches!(upload, UploadOutcome::Unchanged { .. }));

    let load = second.step(Step::Load).unwrap().output.load.clone().unwrap();
    assert_eq!(load.rows_appended, 0);
    assert_eq!(load.rows_skipped, 1);
    assert_eq!(
        pipeline.services().warehouse.partition_rows(run_date).unwrap().len(),
        1
    );
}

#[test]
fn discrepancy_is_a_warning_not_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (av, yf) = both_sources(200.0);
    let pipeline = pipeline(dir.path(), Some(av), yf);

    let manifest = pipeline.run_all(d("2024-01-02")).unwrap();
    let merge = manifest.step(Step::Merge).unwrap();
    assert_eq!(merge.output.merge.as_ref().unwrap().discrepancies.len(), 1);
    assert!(merge.output.warnings[0].contains("AAPL 2024-01-02"));
    // Alpha Vantage wins the conflict by default.
    let rows = pipeline
        .services()
        .warehouse
        .partition_rows(d("2024-01-02"))
        .unwrap();
    assert_eq!(rows[0].close, 185.64);
}

#[test]
fn missing_api_key_stops_at_first_step() {
    let dir = tempfile::tempdir().unwrap();
    let (_, yf) = both_sources(185.64);
    let pipeline = pipeline(dir.path(), None, yf);
    let run_date = d("2024-01-02");

    let err = pipeline.run_all(run_date).unwrap_err();
    let PipelineError::Step(step_err) = err else {
        panic!("expected a step error, got {err:?}");
    };
    assert_eq!(step_err.step, Step::ExtractAlphaVantage);
    assert_eq!(step_err.class(), ErrorClass::Extraction);

    let manifest = RunManifest::load(&pipeline.context(run_date).manifest_path())
        .unwrap()
        .unwrap();
    assert_eq!(manifest.status, RunStatus::Failed);
    assert_eq!(manifest.steps.len(), 1);
    assert!(manifest.steps[0].error.as_deref().unwrap().contains("API key"));
}

#[test]
fn single_step_without_inputs_names_the_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let (av, yf) = both_sources(185.64);
    let pipeline = pipeline(dir.path(), Some(av), yf);

    let err = pipeline.run_step(Step::Merge, d("2024-01-02")).unwrap_err();
    let PipelineError::Step(step_err) = err else {
        panic!("expected a step error");
    };
    match &step_err.kind {
        StepErrorKind::MissingInput { path, producer } => {
            assert!(path.ends_with("alpha_vantage_clean.csv"));
            assert_eq!(*producer, Step::Transform);
        }
        other => panic!("unexpected error kind: {other}"),
    }
}

#[test]
fn steps_can_run_one_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let (av, yf) = both_sources(185.64);
    let pipeline = pipeline(dir.path(), Some(av), yf);
    let run_date = d("2024-01-02");

    for step in Step::ALL {
        let record = pipeline.run_step(step, run_date).unwrap();
        assert_eq!(record.step, step);
    }
    let manifest = RunManifest::load(&pipeline.context(run_date).manifest_path())
        .unwrap()
        .unwrap();
    assert_eq!(manifest.status, RunStatus::Succeeded);
    assert_eq!(manifest.steps.len(), 8);
}

#[test]
fn empty_symbol_fails_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let av = CannedProvider::new(
        Source::AlphaVantage,
        &[("AAPL", vec![bar("2023-12-29", 192.53)])],
    );
    let yf = CannedProvider::new(Source::YahooFinance, &[("AAPL", aapl_history(185.64))]);
    let pipeline = pipeline(dir.path(), Some(av), yf);

    let err = pipeline.run_step(Step::ExtractAlphaVantage, d("2024-01-02")).unwrap_err();
    assert!(err.to_string().contains("AAPL"));
    assert!(!pipeline
        .context(d("2024-01-02"))
        .raw_path(Source::AlphaVantage)
        .exists());
}
