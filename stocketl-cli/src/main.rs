//! StockETL CLI: run the daily pipeline, single steps, and inspection commands.
//!
//! Commands:
//! - `run`: execute all eight steps for a run date, stopping at the first failure
//! - `step <name>`: execute one step against the run's staging directory
//! - `steps`: list step names in pipeline order
//! - `status`: print the run manifest for a date
//! - `config show`: print the effective configuration (secrets redacted)
//! - `warehouse partitions` / `warehouse show`: inspect loaded data

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stocketl_runner::config::PipelineConfig;
use stocketl_runner::pipeline::{Pipeline, PipelineServices, Step};
use stocketl_runner::variables::{EnvVariableStore, JsonFileVariableStore, VariableStore};
use stocketl_runner::{RunManifest, StepRecord};

const DEFAULT_CONFIG_FILE: &str = "stocketl.toml";

#[derive(Parser)]
#[command(name = "stocketl", about = "StockETL: daily stock price ETL pipeline")]
struct Cli {
    /// TOML config file. Defaults to ./stocketl.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON variables file. Without it, variables come from STOCKETL_VAR_* env vars.
    #[arg(long, global = true)]
    variables: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every step for a date.
    Run {
        /// Run date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<String>,
    },
    /// Run a single step for a date.
    Step {
        /// Step name, e.g. extract-yahoo-finance (see `stocketl steps`).
        name: String,

        /// Run date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<String>,
    },
    /// List the pipeline steps in order.
    Steps,
    /// Show the run manifest for a date.
    Status {
        /// Run date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<String>,

        /// Print the raw manifest JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Configuration commands.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Warehouse inspection commands.
    Warehouse {
        #[command(subcommand)]
        action: WarehouseAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
}

#[derive(Subcommand)]
enum WarehouseAction {
    /// List loaded date partitions.
    Partitions,
    /// Print the rows of one partition.
    Show {
        /// Partition date (YYYY-MM-DD).
        #[arg(long)]
        date: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Steps => {
            for (i, step) in Step::ALL.iter().enumerate() {
                println!("{:>2}. {:<22} {}", i + 1, step.as_str(), step.description());
            }
            Ok(())
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => {
            let config = load_config(cli.config.as_deref(), cli.variables.as_deref())?;
            print!("{}", redacted(&config).to_toml()?);
            Ok(())
        }
        Commands::Status { date, json } => {
            let config = load_config(cli.config.as_deref(), cli.variables.as_deref())?;
            run_status(&config, parse_date(date.as_deref())?, json)
        }
        Commands::Run { date } => {
            let pipeline = build_pipeline(cli.config.as_deref(), cli.variables.as_deref())?;
            let run_date = parse_date(date.as_deref())?;
            let manifest = pipeline.run_all(run_date)?;
            print_manifest(&manifest);
            Ok(())
        }
        Commands::Step { name, date } => {
            let step: Step = name.parse()?;
            let pipeline = build_pipeline(cli.config.as_deref(), cli.variables.as_deref())?;
            let record = pipeline.run_step(step, parse_date(date.as_deref())?)?;
            print_step(&record);
            Ok(())
        }
        Commands::Warehouse { action } => {
            let config = load_config(cli.config.as_deref(), cli.variables.as_deref())?;
            let services = PipelineServices::from_config(&config)?;
            match action {
                WarehouseAction::Partitions => {
                    let partitions = services.warehouse.loaded_partitions()?;
                    println!("Table: {}", services.warehouse.table_ref());
                    if partitions.is_empty() {
                        println!("No partitions loaded.");
                    }
                    for date in partitions {
                        println!("  {date}");
                    }
                    Ok(())
                }
                WarehouseAction::Show { date } => {
                    let date = parse_date(Some(&date))?;
                    let rows = services.warehouse.partition_rows(date)?;
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                    Ok(())
                }
            }
        }
    }
}

/// Text logs to stderr, or JSON lines with `--log-json`. `RUST_LOG` overrides the `info` default.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>, variables: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(p) => PipelineConfig::from_file(p)
            .with_context(|| format!("loading config {}", p.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            PipelineConfig::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => {
            tracing::debug!("no config file, using defaults");
            PipelineConfig::default()
        }
    };

    let store: Box<dyn VariableStore> = match variables {
        Some(p) => Box::new(
            JsonFileVariableStore::load(p)
                .with_context(|| format!("loading variables {}", p.display()))?,
        ),
        None => Box::new(EnvVariableStore::new()),
    };
    config.apply_variables(store.as_ref())?;
    tracing::debug!(config = ?config, store = store.name(), "configuration loaded");
    Ok(config)
}

fn build_pipeline(path: Option<&Path>, variables: Option<&Path>) -> Result<Pipeline> {
    let config = load_config(path, variables)?;
    Ok(Pipeline::from_config(config)?)
}

fn parse_date(value: Option<&str>) -> Result<NaiveDate> {
    match value {
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid date '{s}', expected YYYY-MM-DD")),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

fn redacted(config: &PipelineConfig) -> PipelineConfig {
    let mut shown = config.clone();
    if shown.alpha_vantage.api_key.is_some() {
        shown.alpha_vantage.api_key = Some("<redacted>".to_string());
    }
    shown
}

fn run_status(config: &PipelineConfig, run_date: NaiveDate, json: bool) -> Result<()> {
    let path = stocketl_runner::RunContext::new(config, run_date).manifest_path();
    let Some(manifest) = RunManifest::load(&path)? else {
        bail!("no manifest for {run_date} at {}", path.display());
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
    } else {
        print_manifest(&manifest);
    }
    Ok(())
}

fn print_step(record: &StepRecord) {
    println!(
        "{:<22} {:<10} {:>8} ms  {:>6} records",
        record.step.as_str(),
        format!("{:?}", record.status).to_lowercase(),
        record.duration_ms,
        record.output.records
    );
    if let Some(err) = &record.error {
        for line in err.lines() {
            println!("    ERROR: {line}");
        }
    }
    for warn in &record.output.warnings {
        println!("    WARNING: {warn}");
    }
}

fn print_manifest(manifest: &RunManifest) {
    println!();
    println!("=== StockETL Run {} ===", manifest.run_date);
    println!("Window:   {}", manifest.window);
    println!("Symbols:  {}", manifest.symbols.join(", "));
    println!("Status:   {:?}", manifest.status);
    println!();
    for record in &manifest.steps {
        print_step(record);
    }
    if let Some(load) = manifest
        .steps
        .iter()
        .find_map(|s| s.output.load.as_ref())
    {
        println!();
        println!(
            "Loaded {} row(s) into {} ({} partition(s) new, {} skipped)",
            load.rows_appended,
            load.table,
            load.partitions_loaded.len(),
            load.partitions_skipped.len()
        );
    }
    println!();
}
