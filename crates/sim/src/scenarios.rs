//! Simulation scenarios: a hub and its ground stations in one process, over simulated radio links

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use log::debug;
use tdma_core::{NodeId, SlotId, TdmaConfig, TdmaError};
use tdma_radio::scheduler::SchedulerStatus;
use tdma_radio::{Delivery, GroundStation, Hub, Inbound, LinkConfig, SimulatedLink};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

const HUB_ID: &str = "SAT_SIM";
pub const SHARED_SLOTS: u32 = 4;

/// Outcome of one simulated station's run.
#[derive(Debug, Clone)]
pub struct StationReport {
    pub node_id: NodeId,
    pub assigned_slot: Option<SlotId>,
    pub transmissions: usize,
    pub acks: usize,
    pub frames_dropped: u64,
}

pub struct SharingOutcome {
    pub reports: Vec<StationReport>,
    pub delivered: usize,
    pub table: SchedulerStatus,
}

fn attach_station(
    hub: &Arc<Hub>,
    config: &TdmaConfig,
    link: &LinkConfig,
    id: &str,
) -> Result<GroundStation<SimulatedLink>> {
    let (station_end, hub_end) = SimulatedLink::pair(link.clone());
    tokio::spawn(Arc::clone(hub).serve_connection(hub_end, id.to_string()));
    Ok(GroundStation::new(NodeId::new(id)?, config, station_end, config.slot_duration())?)
}

/// Stations contend once, are granted slots by the hub, then report in their
/// own slot `rounds` times.
pub async fn slot_sharing(link: LinkConfig, num_stations: usize, rounds: usize) -> Result<SharingOutcome> {
    let config = TdmaConfig {
        total_slots: SHARED_SLOTS,
        slot_duration_ms: 1000,
        ..Default::default()
    };
    let (hub, mut deliveries) = Hub::new(NodeId::new(HUB_ID)?, &config, link.clone())?;
    hub.start();

    let mut tasks = Vec::new();
    for i in 0..num_stations {
        let station = attach_station(&hub, &config, &link, &format!("GS_{:03}", i + 1))?;
        tasks.push(tokio::spawn(run_station(station, rounds)));
    }

    let mut reports = Vec::new();
    for task in tasks {
        reports.push(task.await??);
    }

    let delivered = drain(&mut deliveries).len();
    let table = hub.scheduler().status();
    hub.shutdown();
    Ok(SharingOutcome { reports, delivered, table })
}

async fn run_station(mut station: GroundStation<SimulatedLink>, rounds: usize) -> tdma_radio::Result<StationReport> {
    let slot_duration = station.clock().slot_duration();
    let max_attempts = rounds * station.clock().total_slots() as usize * 2;
    let mut transmissions = 0;
    let mut acks = 0;

    for _ in 0..max_attempts {
        if transmissions == rounds {
            break;
        }
        let reading = format!("{} reading {}", station.node_id(), transmissions);
        if station.send_in_slot(reading.as_bytes()).await?.is_some() {
            transmissions += 1;
            match station.receive(Some(slot_duration)).await {
                Ok(Inbound::SlotAssigned(_)) => acks += 1,
                Ok(other) => debug!("{} got {:?}", station.node_id(), other),
                Err(TdmaError::Timeout) => debug!("{} heard no ack", station.node_id()),
                Err(e) if e.is_connection_error() => return Err(e),
                Err(e) => debug!("{} dropped a reply: {}", station.node_id(), e),
            }
        }
        let wait = station.clock().until_next_slot(SystemTime::now());
        sleep(wait + Duration::from_millis(10)).await;
    }

    let (_, frames_dropped, _) = station.transport().get_stats().await;
    Ok(StationReport {
        node_id: station.node_id().clone(),
        assigned_slot: station.assigned_slot(),
        transmissions,
        acks,
        frames_dropped,
    })
}

/// Uploads payloads of growing size with small fragments and times each
/// until the hub has reassembled it.
pub async fn fragmentation_test(link: LinkConfig) -> Result<()> {
    let config = TdmaConfig {
        slot_duration_ms: 60_000,
        fragment_timeout_ms: 30_000,
        max_fragment_payload: 256,
        ..Default::default()
    };
    let (hub, mut deliveries) = Hub::new(NodeId::new(HUB_ID)?, &config, link.clone())?;
    let mut station = attach_station(&hub, &config, &link, "GS_BULK")?;

    for size in [320usize, 1024, 3200] {
        let payload = vec![0x55; size];
        let fragments = size.div_ceil(config.max_fragment_payload);
        let start = Instant::now();
        station.send_in_slot(&payload).await?;

        // acks are not read here; the hub's replies just queue up on the link
        match timeout(Duration::from_secs(30), deliveries.recv()).await {
            Ok(Some(delivery)) if delivery.payload == payload => {
                let elapsed = start.elapsed();
                println!(
                    "  {} bytes in {} fragments: {:?}, {:.0} bps effective",
                    size,
                    fragments,
                    elapsed,
                    (size * 8) as f64 / elapsed.as_secs_f64()
                );
            }
            Ok(_) | Err(_) => {
                println!("  {} bytes in {} fragments: incomplete, a fragment was lost", size, fragments);
                hub.assembler()
                    .evict_stale(Instant::now() + config.fragment_timeout() + Duration::from_millis(1));
            }
        }
    }

    let (sent, dropped, bytes) = station.transport().get_stats().await;
    println!("  link: {} frames sent, {} dropped, {} bytes", sent, dropped, bytes);
    Ok(())
}

fn drain(rx: &mut mpsc::Receiver<Delivery>) -> Vec<Delivery> {
    let mut out = Vec::new();
    while let Ok(delivery) = rx.try_recv() {
        out.push(delivery);
    }
    out
}
