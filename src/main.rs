//! # Suspension Tuner
//!
//! Remote tuning and auto-leveling for a four-corner active suspension rig.
//!
//! # Commands
//!
//! - `health`: check that the device answers and its IMU is present
//! - `sensors`: print one orientation/battery snapshot
//! - `monitor`: stream live telemetry until Ctrl+C
//! - `level`: run one auto-level session
//! - `set-level`: store the current orientation as level
//!
//! # Examples
//!
//! ```bash
//! suspension-tuner --address 192.168.4.1 level
//! RUST_LOG=debug suspension-tuner --config tuner.toml monitor
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use suspension_tuner::actuator::ActuatorClient;
use suspension_tuner::config::Config;
use suspension_tuner::device::{DeviceClient, Endpoint, HttpTransport, ReqwestTransport};
use suspension_tuner::leveling::{AutoLevelController, Phase, SessionOutcome};
use suspension_tuner::sensors::SensorAccessor;
use suspension_tuner::telemetry::{TelemetryChannel, TelemetryRecorder, WsConnector};

#[derive(Parser, Debug)]
#[command(name = "suspension-tuner", version)]
#[command(about = "Remote tuning and auto-leveling for a four-corner suspension rig", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Device address, overrides the configuration file
    #[arg(long, short)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Check device health
    Health,
    /// Stream live telemetry until Ctrl+C
    Monitor,
    /// Run one auto-level session
    Level,
    /// Store the current orientation as level
    SetLevel,
    /// Print one sensor snapshot
    Sensors,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(address) = &cli.address {
        config.device.address = address.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!("Suspension Tuner v{} starting...", env!("CARGO_PKG_VERSION"));

    let endpoint = Endpoint::from_config(&config.device)?;
    info!(address = endpoint.address(), url = %endpoint.http_url(""), "using device");

    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(endpoint.clone(), config.device.http_timeout())?);

    match cli.command {
        Command::Health => health(&transport).await,
        Command::Sensors => sensors(&transport, &config).await,
        Command::Monitor => monitor(&endpoint, &config).await,
        Command::Level => level(&transport, &config).await,
        Command::SetLevel => set_level(&transport, &config).await,
    }
}

async fn health(transport: &Arc<dyn HttpTransport>) -> Result<()> {
    let health = DeviceClient::new(Arc::clone(transport)).health().await?;
    println!("status: {}", health.status);
    println!("imu:    {}", if health.mpu6050 { "present" } else { "missing" });
    if !health.is_ok() {
        bail!("device reported status '{}'", health.status);
    }
    Ok(())
}

async fn sensors(transport: &Arc<dyn HttpTransport>, config: &Config) -> Result<()> {
    let accessor = SensorAccessor::new(Arc::clone(transport), &config.sensors);
    let sample = accessor.snapshot().await?;

    let show = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}", v));
    println!("roll:   {}°", show(sample.roll));
    println!("pitch:  {}°", show(sample.pitch));
    println!("yaw:    {}°", show(sample.yaw));
    println!("accel:  {} g", show(sample.vertical_accel));
    for (i, volts) in sample.voltages.iter().enumerate() {
        println!("batt {}: {} V", i + 1, show(*volts));
    }
    Ok(())
}

async fn monitor(endpoint: &Endpoint, config: &Config) -> Result<()> {
    let connector = Arc::new(WsConnector::new(endpoint.stream_url()));
    let channel = TelemetryChannel::new(connector, config.telemetry.reconnect_delay());

    let _telemetry = channel.subscribe("telemetry", |message| {
        let body = &message.body;
        info!(
            roll = %body["roll"],
            pitch = %body["pitch"],
            yaw = %body["yaw"],
            accel = %body["verticalAccel"],
            "telemetry"
        );
    });
    let _battery = channel.subscribe("battery", |message| {
        info!(voltages = %message.body["voltages"], "battery");
    });

    let _recording = if config.telemetry.record {
        let recorder = Arc::new(TelemetryRecorder::open(&config.telemetry)?);
        Some(recorder.attach(&channel))
    } else {
        None
    };

    channel.connect();
    info!("Press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    channel.shutdown();
    Ok(())
}

fn controller(transport: &Arc<dyn HttpTransport>, config: &Config) -> AutoLevelController {
    AutoLevelController::new(
        Arc::new(SensorAccessor::new(Arc::clone(transport), &config.sensors)),
        Arc::new(ActuatorClient::new(Arc::clone(transport))),
        Arc::new(DeviceClient::new(Arc::clone(transport))),
        config.leveling.clone(),
    )
}

async fn level(transport: &Arc<dyn HttpTransport>, config: &Config) -> Result<()> {
    let controller = controller(transport, config);
    let mut status = controller.subscribe();

    let printer = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if current.phase != Phase::Idle {
                println!("[{}] {}", current.phase, current.message);
            }
        }
    });

    let report = tokio::select! {
        report = controller.trigger() => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, trims stay at their last commanded positions");
            printer.abort();
            bail!("auto-level interrupted");
        }
    };
    printer.abort();

    println!(
        "iterations: {}, writes: {}, reversed: {:?}",
        report.iterations,
        report.writes,
        report
            .detected_polarity
            .iter()
            .filter(|(_, reversed)| **reversed)
            .map(|(key, _)| key.as_str())
            .collect::<Vec<_>>()
    );

    match report.outcome {
        SessionOutcome::Succeeded => Ok(()),
        SessionOutcome::Failed(reason) => bail!(reason),
    }
}

async fn set_level(transport: &Arc<dyn HttpTransport>, config: &Config) -> Result<()> {
    controller(transport, config).set_level().await?;
    println!("current orientation stored as level");
    Ok(())
}
