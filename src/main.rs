use std::path::PathBuf;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;

mod config;
mod engine;
mod escalation;
mod manager;
mod messages;
mod mqtt;
mod occupancy;
mod presence;
mod scanner;
mod settings;

#[derive(Parser, Debug)]
#[command(version, about = "Alarms when a vehicle is left while a dependent is believed aboard")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logger = pretty_env_logger::formatted_builder();
    logger.parse_filters(&args.log_level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    let config_contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: config::AppConfig =
        toml::de::from_str(&config_contents).context("parsing config")?;

    match &config.devices {
        Some(devices) if !devices.is_empty() => info!("Devices: {:?}", devices),
        _ => warn!("No presence devices configured; nothing will be detected"),
    }
    info!("Policy: {:?}", config.policy.clone().unwrap_or_default());

    let scan = config.scan.clone().unwrap_or_default();
    let engine = engine::Engine::new(
        Box::new(settings::FileSettings::new(&args.config)),
        scan.interval(),
        scan.missed_intervals(),
    );

    let (input_tx, input_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);

    let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    // Incoming user actions
    let commands = mqtt_client.clone();
    let command_tx = input_tx.clone();
    tokio::spawn(async move {
        commands.event_loop(&mut eventloop, command_tx).await;
    });

    // Outgoing engine events
    tokio::spawn(mqtt_client.clone().notify_loop(event_rx, input_tx.clone()));

    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    let central = adapters
        .into_iter()
        .next()
        .context("no Bluetooth adapter found")?;

    let scanner = scanner::Scanner::new(central, scan.interval(), input_tx);
    tokio::spawn(async move {
        if let Err(err) = scanner.run().await {
            error!("Error handling BTLE events: {:?}", err);
        }
        info!("Done handling BTLE events");
    });

    manager::Manager::new(engine, manager::SystemClock, scan.interval(), input_rx, event_tx)
        .run_loop()
        .await;

    mqtt_client.disconnect().await?;

    Ok(())
}
