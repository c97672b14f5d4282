//! Metadata indexer binary.
//!
//! Loads `dipdup.yml` (or `--config`), starts one indexer per configured
//! network and runs until SIGINT or SIGTERM.

use clap::Parser;
use metadata_indexer::config::DEFAULT_CONFIG_FILE;
use metadata_indexer::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use metadata_indexer::{storage, Config, Indexer, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "metadata-indexer", version, about = "Tezos contract and token metadata indexer")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "METADATA_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log filter, overrides `log_level` of the configuration.
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            let _guard = init_telemetry(TelemetryConfig::with_filter(cli.log_level.as_deref()));
            tracing::error!(config = %cli.config.display(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let filter = cli.log_level.as_deref().or(config.log_level.as_deref());
    let _guard = init_telemetry(TelemetryConfig::with_filter(filter));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.metadata.settings.max_cpu.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Cannot build runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Metadata indexer failed");
            ExitCode::FAILURE
        }
    };
    shutdown_telemetry();
    code
}

async fn run(config: Config) -> Result<()> {
    let mut indexers: Vec<Arc<Indexer>> = Vec::new();

    for (network, indexer_config) in &config.metadata.indexers {
        let started = start_indexer(&config, network, indexer_config).await;
        match started {
            Ok(indexer) => indexers.push(indexer),
            Err(e) => {
                close_all(&indexers).await;
                return Err(e);
            }
        }
    }

    wait_for_signal().await?;
    tracing::info!("Shutting down");
    close_all(&indexers).await;
    Ok(())
}

async fn start_indexer(
    config: &Config,
    network: &str,
    indexer_config: &metadata_indexer::IndexerConfig,
) -> Result<Arc<Indexer>> {
    let db = storage::open(&config.database).await?;
    let indexer = Arc::new(Indexer::new(
        network,
        indexer_config,
        &config.metadata.settings,
        db,
    )?);
    indexer.start().await?;
    Ok(indexer)
}

async fn close_all(indexers: &[Arc<Indexer>]) {
    for indexer in indexers {
        if let Err(e) = indexer.close().await {
            tracing::warn!(network = indexer.network(), error = %e, "Indexer closed with error");
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
