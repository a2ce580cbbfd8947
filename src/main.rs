use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether_gateway::daemon::Components;
use tether_gateway::db::{self, DeviceRepo};
use tether_gateway::{Config, Daemon};

/// Tether - lease coordinator for network-shared devices
#[derive(Parser)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "TETHER_PORT")]
    port: Option<u16>,

    /// `SQLite` database path
    #[arg(long, env = "TETHER_DB_PATH")]
    db: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the device table
    Devices,
    /// Run one liveness sweep and one hygiene sweep, then exit
    Sweep,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,tether_gateway=info",
        1 => "info,tether_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api_server.port = port;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Some(Command::Devices) => print_devices(&config),
        Some(Command::Sweep) => sweep_once(&config).await,
        None => {
            tracing::info!(
                port = config.api_server.port,
                db = %config.db_path.display(),
                "starting tether gateway"
            );
            Daemon::new(config)?.run().await?;
            Ok(())
        }
    }
}

fn print_devices(config: &Config) -> anyhow::Result<()> {
    let pool = db::init(&config.db_path)?;
    let devices = DeviceRepo::new(pool).list()?;

    if devices.is_empty() {
        println!("No devices registered");
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<16} {:<16} {}",
        "DEVICE", "STATE", "GROUP", "HOLDER", "LAST HEARTBEAT"
    );
    for device in devices {
        println!(
            "{:<24} {:<10} {:<16} {:<16} {}",
            device.id,
            device.state,
            device.owning_group,
            device.current_holder.as_deref().unwrap_or("-"),
            device.last_heartbeat.to_rfc3339(),
        );
    }
    Ok(())
}

async fn sweep_once(config: &Config) -> anyhow::Result<()> {
    let pool = db::init(&config.db_path)?;
    let components = Components::build(&pool, config);
    components.coordinator.start()?;

    let sweep = components.tracker.sweep().await;
    let hygiene = components.tracker.hygiene_sweep().await;
    components.coordinator.stop();

    let sweep = sweep?;
    let hygiene = hygiene?;
    println!(
        "probed {} nodes ({} unhealthy), evicted {} devices",
        sweep.nodes_probed, sweep.nodes_unhealthy, sweep.devices_evicted
    );
    println!(
        "purged {} expired grants, evicted {} idle leases",
        hygiene.grants_purged, hygiene.leases_evicted
    );
    Ok(())
}
