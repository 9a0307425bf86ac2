use aqs_anomaly::store::{FsResidualStore, FsSeriesStore};
use aqs_anomaly::{logging, metrics, BatchSummary, EngineConfig, Granularity, Pipeline};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "aqs-pipeline", about = "Precompute spline residuals for anomaly detection")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "AQS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Override the data root from the config
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    /// Override the worker count from the config
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit one spline per site, variable and day
    Hourly,
    /// Fit one spline per site and variable over the full span
    Daily,
    /// Run the hourly and the daily pipeline
    All,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let mut config = match EngineConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("aqs-pipeline: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(data) = args.data {
        config.store.root = data;
    }
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
    }
    logging::init(&config.logging);
    metrics::init();

    let series = match FsSeriesStore::open(&config.store.root) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Failed to open series store.");
            return ExitCode::FAILURE;
        }
    };
    let residuals = Arc::new(FsResidualStore::open(&config.store.root));
    let pipeline = Pipeline::new(series, residuals, config.pipeline.clone());

    let runs = match args.command {
        Command::Hourly => pipeline.run(Granularity::Hourly).map(|s| vec![s]),
        Command::Daily => pipeline.run(Granularity::Daily).map(|s| vec![s]),
        Command::All => pipeline.run_all(),
    };

    match runs {
        Ok(summaries) => {
            print_summaries(&summaries);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Pipeline run failed.");
            ExitCode::FAILURE
        }
    }
}

fn print_summaries(summaries: &[BatchSummary]) {
    for summary in summaries {
        match serde_json::to_string_pretty(summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!(error = %e, "Failed to encode summary."),
        }
    }
}
