use anyhow::{Context as _, Result};
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::info;
use tokio::sync::broadcast;

mod config;
mod frames;
mod messages;
mod mqtt;
mod radio;
mod session;

#[derive(Parser, Debug)]
#[command(about = "Scans for Minew BLE beacons and publishes decoded frames over MQTT")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let config_contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)?;

    let (sink, mut eventloop) = mqtt::MqttSink::new(&config.mqtt);
    sink.subscribe().await?;

    let bt_manager = Manager::new().await?;
    let adapters = bt_manager.adapters().await?;
    let adapter_index = config
        .scan
        .as_ref()
        .and_then(|s| s.adapter_index)
        .unwrap_or(0);
    let central = adapters
        .into_iter()
        .nth(adapter_index)
        .context("no such bluetooth adapter")?;

    let (radio, events) = radio::BtleRadio::new(central);

    // Forward incoming MQTT scan commands to the session.
    let (command_tx, command_rx) = broadcast::channel(10);
    let command_sink = sink.clone();
    tokio::task::spawn(async move {
        command_sink.event_loop(&mut eventloop, command_tx).await;
    });

    let mut session = session::ScanSession::new(radio);
    session.attach_sink(sink);

    if !session.start().await {
        info!("Radio not ready; scanning will start when it powers on");
    }

    session.run(events, command_rx).await;

    if let Some(sink) = session.detach_sink() {
        sink.disconnect().await?;
    }

    Ok(())
}
