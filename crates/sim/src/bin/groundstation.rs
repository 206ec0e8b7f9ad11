//! Ground station node: connects to the hub and reports in its slot

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tdma_core::{NodeId, TdmaConfig, TdmaError};
use tdma_radio::{GroundStation, Inbound, LinkConfig, TcpTransport};

#[derive(Parser, Debug)]
#[command(name = "groundstation", about = "TDMA ground station node")]
struct Cli {
    /// Station id, at most 32 ASCII bytes
    #[arg(short, long, default_value = "GS_001")]
    node_id: String,

    /// Hub address
    #[arg(long, default_value = "127.0.0.1:8080")]
    hub: String,

    /// Slot to transmit in until the hub assigns one
    #[arg(short, long)]
    slot: Option<u32>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between transmissions
    #[arg(long, default_value_t = 3)]
    interval: u64,

    /// Payload to send
    #[arg(long, default_value = "Hello from ground station")]
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = TdmaConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let link = LinkConfig::default();
    let transport = TcpTransport::new(link.clone(), config.max_frame_payload);
    let mut station = GroundStation::new(NodeId::new(cli.node_id)?, &config, transport, link.read_timeout)?;
    if let Some(slot) = cli.slot {
        station.set_assigned_slot(slot)?;
    }

    station.connect(&cli.hub).await.with_context(|| format!("connecting to {}", cli.hub))?;
    match station.query_current_slot().await {
        Ok(slot) => info!("Hub is in slot {}, local clock says {}", slot, station.clock().current_slot()),
        Err(e) => warn!("Hub did not report its slot: {}", e),
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        // wait for our turn, at most one ring
        let mut sent = None;
        for _ in 0..=config.total_slots {
            sent = station.send_in_slot(cli.message.as_bytes()).await?;
            if sent.is_some() {
                break;
            }
            let wait = station.clock().until_next_slot(SystemTime::now());
            tokio::time::sleep(wait + Duration::from_millis(5)).await;
        }
        let Some(slot) = sent else {
            warn!("No transmit opportunity this round");
            continue;
        };
        info!("Sent {} bytes in slot {}", cli.message.len(), slot);

        match station.receive(Some(config.slot_duration())).await {
            Ok(Inbound::SlotAssigned(assigned)) => info!("Hub acknowledged, slot {}", assigned),
            Ok(other) => info!("Hub sent {:?}", other),
            Err(e) if e.is_connection_error() && !matches!(e, TdmaError::Timeout) => {
                return Err(e.into());
            }
            Err(e) => warn!("No acknowledgement: {}", e),
        }
    }

    station.disconnect().await?;
    Ok(())
}
