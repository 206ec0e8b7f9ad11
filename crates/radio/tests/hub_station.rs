use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tdma_core::{NodeId, TdmaConfig};
use tdma_radio::{
    Delivery, GroundStation, Hub, Inbound, LinkConfig, SimulatedLink, TcpTransport, Transport,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> TdmaConfig {
    TdmaConfig {
        slot_duration_ms: 60_000,
        ..Default::default()
    }
}

fn fast_link() -> LinkConfig {
    LinkConfig {
        bandwidth_bps: 0,
        latency: Duration::ZERO,
        ..Default::default()
    }
}

fn node(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

/// Keeps an exchange from straddling a slot boundary.
async fn clear_of_boundary(hub: &Hub) {
    let left = hub.clock().until_next_slot(SystemTime::now());
    if left < Duration::from_secs(2) {
        tokio::time::sleep(left + Duration::from_millis(10)).await;
    }
}

async fn next_delivery(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
    tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

fn simulated_station(hub: &Arc<Hub>, id: &str) -> GroundStation<SimulatedLink> {
    let (station_end, hub_end) = SimulatedLink::pair(fast_link());
    tokio::spawn(Arc::clone(hub).serve_connection(hub_end, id.to_string()));
    GroundStation::new(node(id), &config(), station_end, WAIT).unwrap()
}

#[tokio::test]
async fn stations_share_a_hub_over_simulated_links() {
    let (hub, mut deliveries) = Hub::new(node("SAT_001"), &config(), fast_link()).unwrap();
    clear_of_boundary(&hub).await;

    let mut alpha = simulated_station(&hub, "GS_ALPHA");
    let mut beta = simulated_station(&hub, "GS_BETA");
    alpha.connect("hub").await.unwrap();
    beta.connect("hub").await.unwrap();

    let current = alpha.query_current_slot().await.unwrap();
    assert_eq!(current, hub.clock().current_slot());

    assert_eq!(alpha.send_in_slot(b"alpha telemetry").await.unwrap(), Some(current));
    let Inbound::SlotAssigned(alpha_slot) = alpha.receive(Some(WAIT)).await.unwrap() else {
        panic!("alpha expected a slot assignment");
    };
    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.node_id, node("GS_ALPHA"));
    assert_eq!(delivery.payload, b"alpha telemetry");

    assert_eq!(beta.send_in_slot(b"beta telemetry").await.unwrap(), Some(current));
    let Inbound::SlotAssigned(beta_slot) = beta.receive(Some(WAIT)).await.unwrap() else {
        panic!("beta expected a slot assignment");
    };
    assert_eq!(next_delivery(&mut deliveries).await.node_id, node("GS_BETA"));

    assert_ne!(alpha_slot, beta_slot);
    assert_eq!(alpha.assigned_slot(), Some(alpha_slot));
    let owners = hub.scheduler().snapshot();
    assert_eq!(owners[&alpha_slot], node("GS_ALPHA"));
    assert_eq!(owners[&beta_slot], node("GS_BETA"));

    alpha.disconnect().await.unwrap();
    beta.disconnect().await.unwrap();
}

#[tokio::test]
async fn fragmented_upload_over_tcp() {
    let (hub, mut deliveries) = Hub::new(node("SAT_001"), &config(), LinkConfig::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::clone(&hub).run(listener));
    clear_of_boundary(&hub).await;

    let transport = TcpTransport::new(LinkConfig::default(), config().max_frame_payload);
    let mut station = GroundStation::new(node("GS_TCP"), &config(), transport, WAIT).unwrap();
    station.connect(&addr).await.unwrap();

    let current = station.query_current_slot().await.unwrap();
    let image: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();
    assert_eq!(station.send_in_slot(&image).await.unwrap(), Some(current));

    // one acknowledgement per fragment, all naming the same slot
    let mut granted = Vec::new();
    for _ in 0..3 {
        match station.receive(Some(WAIT)).await.unwrap() {
            Inbound::SlotAssigned(slot) => granted.push(slot),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(granted.iter().all(|&slot| slot == granted[0]));

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.node_id, node("GS_TCP"));
    assert_eq!(delivery.slot_id, current);
    assert_eq!(delivery.payload, image);
    assert_eq!(hub.assembler().pending(), 0);

    station.disconnect().await.unwrap();
}

#[tokio::test]
async fn garbage_on_the_wire_does_not_end_the_connection() {
    let (hub, _deliveries) = Hub::new(node("SAT_001"), &config(), fast_link()).unwrap();
    let (mut raw, hub_end) = SimulatedLink::pair(fast_link());
    tokio::spawn(Arc::clone(&hub).serve_connection(hub_end, "raw".to_string()));

    raw.send_bytes(b"definitely not a frame").await.unwrap();

    clear_of_boundary(&hub).await;
    let mut station = GroundStation::new(node("GS_RAW"), &config(), raw, WAIT).unwrap();
    assert_eq!(station.query_current_slot().await.unwrap(), hub.clock().current_slot());
}
