use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vibot_bridge::config::BridgeConfig;
use vibot_bridge::device::Device;
use vibot_bridge::forwarder::MqttSource;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Forwards robot sensor streams to an MQTT broker and answers remote commands
#[derive(Parser, Debug)]
#[command(name = "vibot-bridge", version)]
struct Args {
    /// Configuration file (TOML), created with defaults if missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides RUST_LOG
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.log_level)?;

    let config = BridgeConfig::load_or_create(args.config).await?;
    info!(
        "Starting device {} against broker {}",
        config.broker.client_id,
        config.broker.broker_addr()
    );

    let shutdown = CancellationToken::new();
    let (source, pump) = MqttSource::new(&config.source);
    let pump_task = tokio::spawn(pump.run(shutdown.clone()));
    let device = Device::from_config(&config, Arc::new(source), shutdown.clone())
        .map_err(|e| eyre!("Failed to set up device: {}", e))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        signal.cancel();
    });

    let result = device.run().await;
    shutdown.cancel();
    if let Err(e) = pump_task.await {
        error!("Sensor source task failed: {}", e);
    }
    result?;
    info!("Device stopped");
    Ok(())
}

fn setup(log_level: Option<LogLevel>) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if let Some(level) = log_level {
        std::env::set_var("RUST_LOG", level.as_directive())
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
