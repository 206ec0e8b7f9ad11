//! TDMA radio link: frame codec, fragmentation, slot scheduling and the node controllers

use std::time::Duration;
use serde::{Deserialize, Serialize};

pub mod control;
pub mod fragment;
pub mod framing;
pub mod hub;
pub mod scheduler;
pub mod simulated;
pub mod station;
pub mod transport;

pub use control::Control;
pub use fragment::FragmentAssembler;
pub use framing::{Frame, FrameFlags};
pub use hub::{Delivery, Hub};
pub use scheduler::{SlotRecord, SlotScheduler, SlotState};
pub use simulated::SimulatedLink;
pub use station::{GroundStation, Inbound};
pub use transport::{FrameReader, TcpTransport, Transport};

pub use tdma_core::{Result, TdmaError};

/// Physical link parameters shared by the TCP transport and the simulated link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub mtu: usize,
    pub bandwidth_bps: u32,
    pub packet_loss: f32,
    pub latency: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mtu: 64 * 1024,
            bandwidth_bps: 9600,
            packet_loss: 0.0,
            latency: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}
