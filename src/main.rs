//! CLI entry point for the WebSQ detector system.
//!
//! ```bash
//! websq status
//! websq acquire 20 --period-ms 100
//! websq set-bias 12.0 8.0 3.0 8.0
//! websq set-bias --all 10.0
//! websq calibrate --dark-counts 100 100 100 100
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use websq_control::analysis::{channel_means, count_rates, uniform_setting};
use websq_control::config::{WebSqConfig, DEFAULT_CONFIG_PATH};
use websq_control::network::DeviceError;
use websq_control::{logging, WebSq};

#[derive(Parser)]
#[command(name = "websq")]
#[command(about = "Control and read out a WebSQ SNSPD system", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print detector settings and channel health
    Status,

    /// Acquire counts samples and print them as CSV
    Acquire {
        /// Number of samples
        n: usize,

        /// Set this measurement period (ms) first and print rates per second
        #[arg(long)]
        period_ms: Option<u32>,
    },

    /// Set the bias current (µA) of every detector
    SetBias {
        /// One value per detector
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        values: Vec<f64>,

        /// Apply one value to every detector
        #[arg(long)]
        all: Option<f64>,
    },

    /// Run automatic bias calibration against target dark counts
    Calibrate {
        /// Target dark counts, one per detector
        #[arg(long, required = true, num_args = 1..)]
        dark_counts: Vec<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WebSqConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let on_error = Arc::new(|err: DeviceError| eprintln!("device error: {err}"));
    let websq = WebSq::connect_with_error_handler(&config, on_error)
        .await
        .context("connecting to WebSQ")?;

    let result = match cli.command {
        Commands::Status => status(&websq).await,
        Commands::Acquire { n, period_ms } => acquire(&websq, n, period_ms).await,
        Commands::SetBias { values, all } => set_bias(&websq, values, all).await,
        Commands::Calibrate { dark_counts } => calibrate(&websq, &config, &dark_counts).await,
    };

    websq.close().await;
    result
}

async fn status(websq: &WebSq) -> Result<()> {
    println!("detectors:          {}", websq.number_of_detectors());
    println!("bias current (µA):  {:?}", websq.get_bias_current().await?);
    println!("trigger level (mV): {:?}", websq.get_trigger_level().await?);
    println!("period (ms):        {}", websq.get_measurement_period().await?);
    let health = websq.health();
    println!("control channel:    {:?}", health.control);
    println!("counts channel:     {:?}", health.counts);
    Ok(())
}

async fn set_bias(websq: &WebSq, values: Vec<f64>, all: Option<f64>) -> Result<()> {
    let values = match all {
        Some(value) => uniform_setting(websq.number_of_detectors(), value),
        None => values,
    };
    websq.set_bias_current(&values).await?;
    Ok(())
}

async fn acquire(websq: &WebSq, n: usize, period_ms: Option<u32>) -> Result<()> {
    if let Some(period_ms) = period_ms {
        websq.set_measurement_period(period_ms).await?;
        websq
            .wait_for_measurement_period(period_ms)
            .await
            .context("device did not confirm the measurement period")?;
    }
    let mut samples = websq.acquire_counts(n).await?;
    if let Some(period_ms) = period_ms {
        samples = count_rates(&samples, f64::from(period_ms))?;
    }

    for sample in &samples {
        let counts: Vec<String> = sample.counts.iter().map(f64::to_string).collect();
        println!("{},{}", sample.timestamp, counts.join(","));
    }
    if let Some(means) = channel_means(&samples) {
        tracing::info!(?means, "per-channel mean");
    }
    Ok(())
}

async fn calibrate(websq: &WebSq, config: &WebSqConfig, dark_counts: &[f64]) -> Result<()> {
    websq.set_dark_counts_for_auto_calibration(dark_counts).await?;
    println!("Calibrating. Keep the detectors dark until it finishes.");
    websq.trigger_auto_calibration().await?;
    websq
        .wait_for_auto_calibration(config.channels.calibration_poll())
        .await?;
    println!("bias current (µA): {:?}", websq.get_bias_current().await?);
    Ok(())
}
