//! DriveSafe - OBD-II scanner for Wi-Fi ELM327 adapters

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use obd_protocol::{DtcCategory, ObdClient, SensorFrame};
use obd_scheduler::{PidScheduler, SchedulerConfig};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{AppConfig, LoggingConfig};

#[derive(Parser)]
#[command(name = "drivesafe")]
#[command(author, version, about = "OBD-II diagnostics over a Wi-Fi ELM327 adapter")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DRIVESAFE_CONFIG")]
    config: Option<PathBuf>,

    /// Adapter host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Adapter port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read trouble codes (all categories unless one is given)
    Scan {
        #[arg(long, value_enum)]
        category: Option<CategoryArg>,
    },

    /// Clear stored trouble codes
    Clear,

    /// Stream RPM, speed and coolant temperature
    Live {
        /// Number of frames to print
        #[arg(long, default_value_t = 10)]
        frames: usize,

        /// RPM/speed polling rate in Hz
        #[arg(long, default_value_t = 5.0)]
        rate: f64,
    },

    /// Send a raw AT or OBD command and print the data lines
    Raw { command: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum CategoryArg {
    Pending,
    Confirmed,
    Permanent,
}

impl From<CategoryArg> for DtcCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Pending => DtcCategory::Pending,
            CategoryArg::Confirmed => DtcCategory::Confirmed,
            CategoryArg::Permanent => DtcCategory::Permanent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = cli.host.clone() {
        config.obd.host = host;
    }
    if let Some(port) = cli.port {
        config.obd.port = port;
    }

    init_logging(&config.logging, cli.verbose);
    info!("=== DriveSafe OBD v{} ===", env!("CARGO_PKG_VERSION"));

    let client = ObdClient::new(config.obd.clone());
    client.connect().await.with_context(|| {
        format!(
            "OBD2 adapter is not reachable at {}:{}. Make sure the device is on the adapter's Wi-Fi and the vehicle is running.",
            config.obd.host, config.obd.port
        )
    })?;

    let result = run(&client, cli.command).await;
    client.disconnect().await;
    result
}

async fn run(client: &ObdClient, command: Commands) -> Result<()> {
    match command {
        Commands::Scan { category: Some(category) } => {
            let codes = client.scan(category.into()).await?;
            if codes.as_ref().map_or(true, Vec::is_empty) {
                info!("No Diagnostic Trouble Codes (DTCs) were found");
            }
            print_json(&codes.unwrap_or_default())
        }
        Commands::Scan { category: None } => {
            let codes = client.scan_all().await?;
            if codes.is_empty() {
                info!("No Diagnostic Trouble Codes (DTCs) were found");
            }
            print_json(&codes.into_vec())
        }
        Commands::Clear => {
            if !client.clear().await? {
                bail!("Failed to clear DTCs");
            }
            print_json(&serde_json::json!({ "cleared": true }))
        }
        Commands::Live { frames, rate } => live(client, frames, rate).await,
        Commands::Raw { command } => print_json(&client.send_command(&command).await?),
    }
}

async fn live(client: &ObdClient, frames: usize, rate: f64) -> Result<()> {
    let mut scheduler = PidScheduler::new(SchedulerConfig {
        base_rate_hz: rate,
        ..Default::default()
    })?;
    let (tx, mut rx) = mpsc::channel::<SensorFrame>(16);

    let printer = async move {
        for _ in 0..frames {
            let Some(frame) = rx.recv().await else {
                break;
            };
            print_json(&frame)?;
        }
        Ok::<_, anyhow::Error>(())
    };

    let (polled, printed) = tokio::join!(scheduler.run(client, tx), printer);
    if let Err(e) = polled {
        warn!("Live data stopped: {}", e);
        return Err(e.into());
    }
    printed
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize logging on stderr so stdout stays machine readable
fn init_logging(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(&config.level)
        }
    });

    let layer = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry().with(layer).with(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_scan_category() {
        let cli = Cli::parse_from(["drivesafe", "--port", "23", "scan", "--category", "pending"]);
        assert_eq!(cli.port, Some(23));
        match cli.command {
            Commands::Scan { category: Some(category) } => {
                assert_eq!(DtcCategory::from(category), DtcCategory::Pending)
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn test_parse_raw() {
        let cli = Cli::parse_from(["drivesafe", "raw", "ATDPN"]);
        assert!(matches!(cli.command, Commands::Raw { command } if command == "ATDPN"));
    }
}
