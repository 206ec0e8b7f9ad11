//! Ground station: transmits only in its own slot and tracks the slot the hub grants it

use std::time::{Duration, SystemTime};

use log::{debug, info, trace};
use tdma_core::{NodeId, Result, SlotClock, SlotId, TdmaConfig, TdmaError};
use tokio::time::Instant;

use crate::control::Control;
use crate::fragment::FragmentAssembler;
use crate::framing::Frame;
use crate::transport::Transport;

/// What one received frame meant to the station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The hub acknowledged a transmission and granted this slot.
    SlotAssigned(SlotId),
    CurrentSlot(SlotId),
    Payload { from: NodeId, payload: Vec<u8> },
    /// A fragment of a payload still being reassembled, or a frame with nothing for the caller.
    Pending,
}

pub struct GroundStation<T> {
    node_id: NodeId,
    clock: SlotClock,
    transport: T,
    assembler: FragmentAssembler,
    assigned_slot: Option<SlotId>,
    max_fragment_payload: usize,
    read_timeout: Duration,
}

impl<T: Transport> GroundStation<T> {
    pub fn new(node_id: NodeId, config: &TdmaConfig, transport: T, read_timeout: Duration) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            node_id,
            clock: SlotClock::from_config(config)?,
            transport,
            assembler: FragmentAssembler::from_config(config),
            assigned_slot: None,
            max_fragment_payload: config.max_fragment_payload,
            read_timeout,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn clock(&self) -> &SlotClock {
        &self.clock
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn assigned_slot(&self) -> Option<SlotId> {
        self.assigned_slot
    }

    pub fn set_assigned_slot(&mut self, slot_id: SlotId) -> Result<()> {
        if slot_id >= self.clock.total_slots() {
            return Err(TdmaError::InvalidSlotId(slot_id));
        }
        self.assigned_slot = Some(slot_id);
        Ok(())
    }

    pub async fn connect(&mut self, address: &str) -> Result<()> {
        self.transport.connect(address).await?;
        info!("Station {} connected to {}", self.node_id, address);
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.transport.disconnect().await
    }

    /// Asks the hub which slot it is in. Frames that arrive in between are
    /// processed as usual; gives up with `Timeout` after the read timeout.
    pub async fn query_current_slot(&mut self) -> Result<SlotId> {
        let query = Frame::new(self.clock.current_slot(), self.node_id.clone(), Control::SlotQuery.to_payload());
        self.transport.send_frame(&query).await?;

        let deadline = Instant::now() + self.read_timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(TdmaError::Timeout);
            }
            match self.receive(Some(left)).await {
                Ok(Inbound::CurrentSlot(slot)) => return Ok(slot),
                Ok(other) => trace!("Waiting for slot reply, got {:?}", other),
                Err(e) if e.is_connection_error() => return Err(e),
                Err(e) => debug!("Skipping frame while waiting for slot reply: {}", e),
            }
        }
    }

    pub async fn send_in_slot(&mut self, payload: &[u8]) -> Result<Option<SlotId>> {
        self.send_in_slot_at(payload, SystemTime::now()).await
    }

    /// Transmits `payload` if the clock is in the station's assigned slot,
    /// fragmenting it when needed. A station without an assignment contends
    /// in whatever slot is current. Returns the slot used, or `None` when it
    /// is not this station's turn.
    pub async fn send_in_slot_at(&mut self, payload: &[u8], now: SystemTime) -> Result<Option<SlotId>> {
        let current = self.clock.slot_at(now);
        if let Some(assigned) = self.assigned_slot {
            if assigned != current {
                trace!("Slot {} belongs to someone else, waiting for {}", current, assigned);
                return Ok(None);
            }
        }

        let frames = self.assembler.split(payload, self.max_fragment_payload, &self.node_id, current)?;
        for frame in &frames {
            self.transport.send_frame(frame).await?;
        }
        debug!(
            "Station {} sent {} bytes in slot {} ({} frames)",
            self.node_id,
            payload.len(),
            current,
            frames.len()
        );
        Ok(Some(current))
    }

    /// Receives one frame and interprets it. A slot acknowledgement updates
    /// the assigned slot.
    pub async fn receive(&mut self, timeout: Option<Duration>) -> Result<Inbound> {
        let frame = self.transport.receive_frame(timeout).await?;
        let at = Instant::now();
        self.assembler.evict_stale(at);

        match Control::from_payload(frame.payload()) {
            Control::SlotAck(slot) => {
                self.set_assigned_slot(slot)?;
                info!("Station {} assigned slot {}", self.node_id, slot);
                Ok(Inbound::SlotAssigned(slot))
            }
            Control::CurrentSlot(slot) => Ok(Inbound::CurrentSlot(slot)),
            Control::SlotQuery => {
                debug!("Ignoring slot query from {}", frame.node_id());
                Ok(Inbound::Pending)
            }
            Control::Data(_) => {
                let from = frame.node_id().clone();
                Ok(match self.assembler.feed(frame, at)? {
                    Some(payload) => Inbound::Payload { from, payload },
                    None => Inbound::Pending,
                })
            }
        }
    }
}
