use std::path::PathBuf;

use anyhow::{Context, Result};
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::{debug, info};
use tokio::sync::mpsc;

mod actions;
mod config;
mod engine;
mod lock;
mod manager;
mod messages;
mod mqtt;
mod scanner;

/// Runs commands when configured Bluetooth devices come into or leave range.
#[derive(Parser, Debug)]
#[command(name = "proximity", version, about)]
struct Cli {
    /// Config file (created with a template on first run)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Single-instance lock file
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// Seconds between scans
    #[arg(long)]
    interval: Option<u64>,

    /// Seconds each scan listens for devices
    #[arg(long)]
    scan_timeout: Option<u64>,

    /// Maximum number of devices reported by a scan
    #[arg(long)]
    max_devices: Option<usize>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&filters)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_path()?,
    };
    let Some(app_config) = config::load_or_init(&config_path)? else {
        info!("Add your devices to {} and start again", config_path.display());
        return Ok(());
    };
    let settings = app_config
        .settings()
        .with_overrides(cli.interval, cli.scan_timeout, cli.max_devices);
    debug!("Settings: {:?}", settings);

    let lock_path = cli.lock_file.unwrap_or_else(lock::default_path);
    let instance_lock = lock::InstanceLock::acquire(&lock_path)?;
    debug!("Holding instance lock at {}", instance_lock.path().display());

    let bt_manager = Manager::new()
        .await
        .context("Bluetooth stack unavailable")?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    let central = adapters
        .into_iter()
        .next()
        .context("Please connect a bluetooth adapter")?;

    let runner = actions::ShellRunner::new(settings.shell.clone())
        .with_timeout(settings.action_timeout);
    let mut core = manager::Manager::new(
        scanner::BtleScanner::new(central),
        engine::PresenceEngine::new(runner),
        config_path,
        settings,
    );

    if let Some(mqtt_config) = &app_config.mqtt {
        let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
        let (tx, rx) = mpsc::channel(10);
        let event_client = mqtt_client.clone();
        tokio::task::spawn(async move {
            event_client.event_loop(&mut eventloop, tx).await;
        });
        core = core.with_mqtt(mqtt_client, rx);
    }

    let result = if cli.once {
        core.run_cycle().await.map(|_| ())
    } else {
        core.run_loop().await
    };
    drop(instance_lock);
    result
}
