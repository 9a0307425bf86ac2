use aqs_anomaly::api::{self, AppState};
use aqs_anomaly::store::{FsResidualStore, FsSeriesStore};
use aqs_anomaly::{logging, metrics, Dispatcher, EngineConfig};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "aqs-serve", about = "Serve air-quality anomaly detection over HTTP")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "AQS_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data root from the config
    #[arg(long)]
    data: Option<PathBuf>,

    /// Override the bind address from the config
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut config = match EngineConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("aqs-serve: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(data) = args.data {
        config.store.root = data;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    logging::init(&config.logging);
    metrics::init();

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed.");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let series = Arc::new(FsSeriesStore::open(&config.store.root)?);
    let residuals = Arc::new(FsResidualStore::open(&config.store.root));
    let dispatcher = Dispatcher::new(series, residuals, &config.detection);
    info!(root = %config.store.root.display(), "Opened data store.");

    let app = api::router(AppState {
        dispatcher: Arc::new(dispatcher),
    });

    let listener = TcpListener::bind(&config.server.bind).await?;
    info!(addr = %config.server.bind, "Listening.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down.");
            }
        })
        .await?;
    Ok(())
}
