//! Binary entrypoint for the meshcore-mirror CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `check` - validate the config and print the effective endpoint and schedule
//! - `ports` - list serial ports to help pick `device.usb_path`
//! - `simulate --state <file.json> [--ticks N]` - run the scheduler against a simulated node
//!
//! See the library crate docs for module-level details: `meshcore_mirror::`.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use meshcore_mirror::config::Config;
use meshcore_mirror::coordinator::MeshCoordinator;
use meshcore_mirror::device::memory::{MemoryConnector, MemoryDeviceState};

#[derive(Parser)]
#[command(name = "meshcore-mirror")]
#[command(about = "Keeps a local mirror of a MeshCore radio node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Validate the configuration and print the effective settings
    Check,
    /// List serial ports
    Ports,
    /// Poll a simulated node described by a JSON state file
    Simulate {
        /// Simulated device state (JSON)
        #[arg(short, long)]
        state: String,
        /// Stop after this many published snapshots
        #[arg(short, long)]
        ticks: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Initializing new configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Check => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            config.validate()?;
            let summary = serde_json::json!({
                "endpoint": config.endpoint()?,
                "sync_time": config.device.sync_time,
                "polling": config.polling,
                "repeaters": config
                    .repeaters
                    .iter()
                    .map(|r| serde_json::json!({
                        "name": r.name,
                        "guest": r.password.is_empty(),
                        "poll_interval_secs": r.poll_interval_secs,
                        "enabled": r.enabled,
                    }))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Ports => list_ports()?,
        Commands::Simulate { state, ticks } => {
            let config = match pre_config {
                Some(c) => c,
                None => {
                    warn!("No usable config at {}; using defaults", cli.config);
                    Config::default()
                }
            };
            simulate(&config, &state, ticks).await?;
        }
    }
    Ok(())
}

async fn simulate(config: &Config, state_path: &str, ticks: Option<usize>) -> Result<()> {
    let raw = tokio::fs::read_to_string(state_path)
        .await
        .map_err(|e| anyhow!("Failed to read state file {}: {}", state_path, e))?;
    let state: MemoryDeviceState = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("Failed to parse state file {}: {}", state_path, e))?;

    let coordinator = MeshCoordinator::from_config(config, Arc::new(MemoryConnector::new(state)))?;
    info!(
        "Simulating node at {} ({} repeater(s) configured)",
        coordinator.session().endpoint(),
        config.repeaters.len()
    );

    if let Some(mut events) = coordinator.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                info!("event: {}", event);
            }
        });
    }

    let mut snapshots = coordinator.subscribe();
    let poller = coordinator.start();
    let mut published = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("{}", serde_json::to_string_pretty(&*snapshot)?);
                published += 1;
                if ticks.map_or(false, |n| published >= n) {
                    break;
                }
            }
        }
    }

    coordinator.shutdown().await;
    if let Err(e) = poller.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    info!(
        "Metrics: {}",
        serde_json::to_string(&coordinator.metrics()).unwrap_or_default()
    );
    Ok(())
}

#[cfg(feature = "serial")]
fn list_ports() -> Result<()> {
    let ports = serialport::available_ports()
        .map_err(|e| anyhow!("Failed to enumerate serial ports: {}", e))?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let detail = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "USB {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            serialport::SerialPortType::PciPort => "PCI".to_string(),
            serialport::SerialPortType::Unknown => "unknown".to_string(),
        };
        println!("{}\t{}", port.port_name, detail);
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn list_ports() -> Result<()> {
    Err(anyhow!("Port listing requires the 'serial' feature"))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
