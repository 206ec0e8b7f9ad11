//! simulation tools for the TDMA link

pub mod scenarios;

use std::time::Duration;
use tdma_radio::LinkConfig;

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> LinkConfig {
        LinkConfig {
            mtu: 512,
            bandwidth_bps: 9600,
            packet_loss: 0.02,
            latency: Duration::from_millis(50),
            ..Default::default()
        }
    }

    pub fn average_conditions() -> LinkConfig {
        LinkConfig {
            mtu: 512,
            bandwidth_bps: 4800,
            packet_loss: 0.10,
            latency: Duration::from_millis(150),
            ..Default::default()
        }
    }

    pub fn poor_conditions() -> LinkConfig {
        LinkConfig {
            mtu: 512,
            bandwidth_bps: 1200,
            packet_loss: 0.25,
            latency: Duration::from_millis(300),
            ..Default::default()
        }
    }
}
