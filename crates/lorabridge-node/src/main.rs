//! Lorabridge Node - LoRaWAN broker to internal bus bridge
//!
//! This binary runs one bridge deployment:
//! - Connects to the network server's MQTT broker with retry
//! - Forwards joins, uplinks, uplink errors and downlink receipts to the bus
//! - Publishes downlink requests from the bus to devices

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lorabridge_mqtt::{
    adapter, BridgeConfig, BridgeProxy, BrokerClient, IdentityAdjuster, MqttBus, MqttTransport,
};

#[derive(Parser)]
#[command(name = "lorabridge-node")]
#[command(about = "Bridge a LoRaWAN network server broker to the internal message bus")]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, short, conflicts_with = "deployment")]
    config: Option<PathBuf>,

    /// Deployment name, loads `<config-dir>/<deployment>-config.json`
    #[arg(long, short)]
    deployment: Option<String>,

    /// Directory holding deployment configuration files
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Interval between statistics log lines, in seconds (0 disables)
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<BridgeConfig> {
        let config = match (&self.config, &self.deployment) {
            (Some(path), _) => BridgeConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            (None, Some(deployment)) => BridgeConfig::for_deployment(&self.config_dir, deployment)
                .with_context(|| {
                    format!(
                        "loading {}",
                        BridgeConfig::deployment_path(&self.config_dir, deployment).display()
                    )
                })?,
            (None, None) => bail!("either --config or --deployment is required"),
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&BridgeConfig::default())?);
        return Ok(());
    }

    // Initialize logging, RUST_LOG takes precedence over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.load_config()?;
    info!(
        "Starting Lorabridge Node v{}: app={}, broker={}",
        lorabridge_mqtt::VERSION,
        config.broker.app_id,
        config.broker.address
    );

    // Network server broker
    let settings = config.broker.connection_settings(&config.adapter.network);
    let transport = Arc::new(MqttTransport::new(settings, &config.connect)?);
    let client = BrokerClient::new(transport, &config.connect)?;

    // Internal bus
    let Some(bus_settings) = config.bus.connection_settings() else {
        bail!("bus.address is required");
    };
    info!("Internal bus: {}", bus_settings.address);
    let bus_transport = Arc::new(MqttTransport::new(bus_settings, &config.connect)?);
    let bus_client = BrokerClient::new(bus_transport, &config.connect)?;
    bus_client
        .connect()
        .await
        .context("connecting to the internal bus")?;
    let bus = Arc::new(MqttBus::new(bus_client.clone()));

    let adapter = adapter::from_config(&config.adapter, &config.broker.app_id, None);
    info!("Using {} adapter, source={}", adapter.name(), adapter.source());

    let mut proxy = BridgeProxy::new(client, adapter, Arc::new(IdentityAdjuster), bus, &config);
    proxy.initialize().await?;
    info!("Subscribed categories: {:?}", proxy.categories());

    let handle = proxy.run().await?;
    info!(
        "Bridge running: {} forwarding loops, downlinks {}",
        handle.active_loops(),
        if handle.accepts_downlinks() { "enabled" } else { "disabled" }
    );

    let period = Duration::from_secs(args.stats_interval.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick(), if args.stats_interval > 0 => {
                let stats = handle.stats();
                info!(
                    "Stats: received={}, forwarded={}, acknowledged={}, decode_errors={}, publish_errors={}, downlinks_sent={}, downlink_errors={}",
                    stats.received,
                    stats.forwarded,
                    stats.acknowledged,
                    stats.decode_errors,
                    stats.publish_errors,
                    stats.downlinks_sent,
                    stats.downlink_errors
                );
            }
        }
    }

    handle.shutdown().await?;
    if let Err(e) = bus_client.disconnect().await {
        warn!("Internal bus disconnect failed: {}", e);
    }
    info!("Lorabridge Node stopped");
    Ok(())
}
