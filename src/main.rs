//! moonraker-sync - command line front end
//!
//! Connects to a Moonraker server, keeps the synchronized model up to date
//! and either prints it or issues a single command.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use moonraker_sync::discovery;
use moonraker_sync::logging::{init_logging, LogConfig};
use moonraker_sync::services::system_info;
use moonraker_sync::{MachineModel, Session, SyncConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};

/// Moonraker synchronization client
#[derive(Parser, Debug)]
#[command(name = "moonraker-sync")]
#[command(about = "Synchronize with a Moonraker/Klipper machine and send commands")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML)
    #[arg(long, short, global = true, env = "MOONRAKER_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Server address, overrides the configuration
    #[arg(long, global = true)]
    url: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Seconds to wait for the initial snapshot
    #[arg(long, global = true, default_value = "10")]
    sync_timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the model every time it changes
    Watch {
        /// Print full JSON snapshots instead of a status line
        #[arg(long)]
        json: bool,
    },
    /// Print one synchronized snapshot
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run a G-code script
    Gcode { script: String },
    /// Halt the firmware immediately
    Estop,
    /// List discovered objects
    Objects,
    /// Show firmware, host and MCU information
    Info,
    /// Switch a power device
    Power {
        /// Device name; the configured or default device when omitted
        #[arg(long)]
        device: Option<String>,

        #[arg(value_parser = ["on", "off", "status"])]
        action: String,
    },
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<SyncConfig> {
        let mut config = SyncConfig::load(self.config.as_deref())?;
        if let Some(url) = &self.url {
            config.server.url = url.clone();
            config.validate()?;
        }
        Ok(config)
    }

    fn initialize_logging(&self, config: &SyncConfig) -> anyhow::Result<()> {
        let mut log_config = LogConfig::from(&config.logging);
        log_config.apply_env();
        if self.debug {
            log_config.level = Level::DEBUG;
        }
        init_logging(log_config).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    cli.initialize_logging(&config)?;

    info!("Starting moonraker-sync v{}", env!("CARGO_PKG_VERSION"));

    let session = Session::new(&config);
    session
        .connect(&config.server.url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.server.url))?;

    let result = run(&cli, &config, &session).await;
    session.shutdown().await;
    result
}

async fn run(cli: &Cli, config: &SyncConfig, session: &Session) -> anyhow::Result<()> {
    let sync_timeout = Duration::from_secs(cli.sync_timeout);

    match &cli.command {
        Command::Watch { json } => {
            let mut model = session.watch_model();
            session.wait_synced(sync_timeout).await?;
            loop {
                let snapshot = model.borrow_and_update().clone();
                print_model(&snapshot, *json)?;
                tokio::select! {
                    changed = model.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Status { json } => {
            session.wait_synced(sync_timeout).await?;
            print_model(&session.model(), *json)?;
        }
        Command::Gcode { script } => {
            session.commands().script(script).await?;
        }
        Command::Estop => {
            session.commands().emergency_stop().await?;
            println!("Emergency stop sent");
        }
        Command::Objects => {
            let catalog = discovery::discover(session.client()).await?;
            for sensor in &catalog.sensors {
                println!("sensor  {:<32} {}", sensor.id, sensor.label);
            }
            for device in &catalog.devices {
                println!("device  {:<32} {}", device.id, device.label);
            }
            for mcu in &catalog.mcus {
                println!("mcu     {mcu}");
            }
        }
        Command::Info => {
            let client = session.client();
            let firmware = system_info::firmware_info(client).await?;
            println!("{} {} ({})", firmware.name, firmware.version, firmware.state);

            let host = system_info::host_info(client).await?;
            println!(
                "{} / {} cores / {}",
                host.cpu_model,
                host.cpu_cores,
                system_info::format_memory(host.total_memory, &host.memory_units)
            );

            let catalog = discovery::discover(client).await?;
            for mcu in system_info::mcu_info(client, &catalog.mcus, &firmware.name).await? {
                println!("{}: {} {}", mcu.label, mcu.mcu_type, mcu.version);
            }
        }
        Command::Power { device, action } => {
            let power = session.power();
            let registry = session.refresh_power().await?;
            let preferred = device.as_deref().or(config.power.device.as_deref());
            let Some(target) = registry.select(preferred) else {
                bail!("No power devices configured on the server");
            };

            let state = match action.as_str() {
                "status" => power.device_status(&target.device).await,
                other => {
                    session.wait_synced(sync_timeout).await?;
                    let print_state = session.model().print_stats_state;
                    if target.is_locked(print_state.as_deref()) {
                        bail!("'{}' is locked while printing", target.device);
                    }
                    power.set_power(&target.device, other == "on").await?
                }
            };
            println!("{}: {}", target.device, state);
        }
    }
    Ok(())
}

fn print_model(model: &MachineModel, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(model)?);
        return Ok(());
    }

    let temperatures: Vec<String> = model
        .sensors
        .values()
        .map(|s| match s.target {
            Some(target) if target > 0.0 => format!("{} {:.1}/{:.0}", s.label, s.current, target),
            _ => format!("{} {:.1}", s.label, s.current),
        })
        .collect();

    let mut line = format!(
        "{} X{:.2} Y{:.2} Z{:.2} | {}",
        model.status,
        model.position.x,
        model.position.y,
        model.position.z,
        temperatures.join(" | ")
    );
    if let Some(filename) = &model.job.filename {
        line.push_str(&format!(" | {} {:.1}%", filename, model.job.progress * 100.0));
        if let (Some(layer), Some(total)) = (model.job.current_layer, model.job.total_layers) {
            line.push_str(&format!(" layer {layer}/{total}"));
        }
    }
    println!("{line}");
    Ok(())
}
