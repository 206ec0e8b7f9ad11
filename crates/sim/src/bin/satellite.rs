//! Hub node: accepts ground station connections and hands out slots

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tdma_core::{NodeId, TdmaConfig};
use tdma_radio::{Hub, LinkConfig};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "satellite", about = "TDMA hub node")]
struct Cli {
    /// Address to accept ground stations on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Node id announced in replies
    #[arg(long, default_value = "SATELLITE_001")]
    node_id: String,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between slot table printouts
    #[arg(long, default_value_t = 5)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = TdmaConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let (hub, mut deliveries) = Hub::new(NodeId::new(cli.node_id)?, &config, LinkConfig::default())?;

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    hub.start();
    let server = tokio::spawn(Arc::clone(&hub).run(listener));

    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            info!(
                "{} in slot {}: {}",
                delivery.node_id,
                delivery.slot_id,
                String::from_utf8_lossy(&delivery.payload)
            );
        }
    });

    let mut status = tokio::time::interval(Duration::from_secs(cli.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = status.tick() => {
                info!("Slot table:\n{}", hub.scheduler().status());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    server.abort();
    hub.shutdown();
    Ok(())
}
