//! CLI entry point for daq_readout
//!
//! Runs the simulated producer behind a `Readout` so the delivery modes can be
//! exercised without hardware.
//!
//! # Usage
//!
//! Run for ten seconds with the settings from a config file:
//! ```bash
//! daq_readout run --config config/readout.toml --duration-secs 10
//! ```
//!
//! Validate a config file and print it with defaults filled in:
//! ```bash
//! daq_readout check-config config/readout.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_readout::config::AppConfig;
use daq_readout::logging::{self, LoggingConfig};
use daq_readout::{
    Readout, ReadoutMetrics, RequestBuffer, SequenceId, Simulator, Telemetry,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const TRANSITION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "daq_readout")]
#[command(about = "Request-driven fragment readout with a simulated producer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulator behind a readout and print metrics
    Run {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: PathBuf,

        /// Stop after this many seconds (runs until Ctrl+C when omitted)
        #[arg(long)]
        duration_secs: Option<f64>,

        /// Requests per second generated in request-driven modes
        #[arg(long, default_value = "100")]
        request_rate: f64,

        /// Run number
        #[arg(long, default_value = "1")]
        run: u64,
    },

    /// Validate a configuration file and print the resolved settings
    CheckConfig {
        /// Path to the TOML configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration_secs,
            request_rate,
            run,
        } => run_readout(&config, duration_secs, request_rate, run).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("✅ {} is valid", path.display());
    println!();
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn run_readout(
    path: &Path,
    duration_secs: Option<f64>,
    request_rate: f64,
    run: u64,
) -> Result<()> {
    let config = load_config(path)?;
    let logging_config =
        LoggingConfig::from_section(&config.logging).map_err(anyhow::Error::msg)?;
    logging::init(logging_config).map_err(anyhow::Error::msg)?;

    let simulator = Arc::new(Simulator::new(config.simulator.clone()));
    let ledger = Arc::new(RequestBuffer::new());
    let metrics = ReadoutMetrics::new();
    let readout = Arc::new(Readout::new(
        config.readout.clone(),
        simulator.clone(),
        ledger.clone(),
        Telemetry::new(metrics.clone()),
    )?);

    readout.start(run, TRANSITION_TIMEOUT, 0)?;

    let consumer = {
        let readout = Arc::clone(&readout);
        tokio::task::spawn_blocking(move || {
            let mut batch = Vec::new();
            let mut delivered: u64 = 0;
            while readout.fetch_next(&mut batch) {
                delivered += batch.len() as u64;
                batch.clear();
            }
            delivered
        })
    };

    let requests = if config.readout.request_mode.is_request_driven() && request_rate > 0.0 {
        let period = Duration::from_secs_f64(1.0 / request_rate);
        let simulator = Arc::clone(&simulator);
        let ledger = Arc::clone(&ledger);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut sequence_id: SequenceId = 1;
            loop {
                ticker.tick().await;
                if !ledger.add_request(sequence_id, simulator.last_timestamp()) {
                    break;
                }
                sequence_id += 1;
            }
            sequence_id - 1
        }))
    } else {
        None
    };

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))) => {
                    info!(secs, "Run duration elapsed");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Ctrl+C received");
        }
    }

    let stopping = Arc::clone(&readout);
    let stopped = tokio::task::spawn_blocking(move || stopping.stop(TRANSITION_TIMEOUT, 0)).await?;
    if let Err(err) = stopped {
        warn!(error = %err, "Stop reported an error");
    }

    let requested = match requests {
        Some(handle) => handle.await?,
        None => 0,
    };
    let delivered = consumer.await?;

    println!("{}", readout.report());
    let summary = json!({
        "requests_sent": requested,
        "fragments_delivered": delivered,
        "status": readout.stats(),
        "metrics": metrics.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    match readout.latest_exception() {
        Some(message) => anyhow::bail!("Readout exception: {}", message),
        None => Ok(()),
    }
}
