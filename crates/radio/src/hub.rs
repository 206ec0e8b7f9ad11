//! Hub node ("satellite"): answers slot queries, admits data frames sent in
//! the right slot and hands reassembled payloads to the application.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tdma_core::{NodeId, Result, SlotClock, SlotId, TdmaConfig, TdmaError};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::control::Control;
use crate::fragment::FragmentAssembler;
use crate::framing::Frame;
use crate::scheduler::SlotScheduler;
use crate::transport::{TcpTransport, Transport};
use crate::LinkConfig;

const DELIVERY_QUEUE: usize = 1024;

/// A complete payload received from a station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub node_id: NodeId,
    pub slot_id: SlotId,
    pub payload: Vec<u8>,
}

/// Connection tasks share nothing but the scheduler and the assembler, each
/// behind its own lock.
pub struct Hub {
    node_id: NodeId,
    clock: SlotClock,
    scheduler: Arc<SlotScheduler>,
    assembler: Arc<FragmentAssembler>,
    deliveries: mpsc::Sender<Delivery>,
    link: LinkConfig,
    max_frame_payload: u32,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    pub fn new(
        node_id: NodeId,
        config: &TdmaConfig,
        link: LinkConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Delivery>)> {
        config.validate()?;
        let clock = SlotClock::from_config(config)?;
        let scheduler = SlotScheduler::starting_at(
            config.total_slots,
            config.slot_duration(),
            clock.current_slot(),
        )?;
        let (deliveries, rx) = mpsc::channel(DELIVERY_QUEUE);

        let hub = Arc::new(Self {
            node_id,
            clock,
            scheduler: Arc::new(scheduler),
            assembler: Arc::new(FragmentAssembler::from_config(config)),
            deliveries,
            link,
            max_frame_payload: config.max_frame_payload,
            background: Mutex::new(Vec::new()),
        });
        Ok((hub, rx))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn clock(&self) -> &SlotClock {
        &self.clock
    }

    pub fn scheduler(&self) -> &Arc<SlotScheduler> {
        &self.scheduler
    }

    pub fn assembler(&self) -> &Arc<FragmentAssembler> {
        &self.assembler
    }

    /// Processes one received frame and returns the reply to send, if any.
    ///
    /// `now` drives the slot admission check, `at` the scheduler and
    /// reassembly bookkeeping. A frame that fails validation, arrives
    /// outside its slot or does not fit its reassembly is refused with the
    /// corresponding error and has no effect on hub state. Delivery does not
    /// depend on a slot grant: an admitted frame whose sender cannot be given
    /// a slot is still reassembled and delivered, but is not acknowledged.
    pub fn handle_frame(&self, frame: Frame, now: SystemTime, at: Instant) -> Result<Option<Frame>> {
        frame.validate()?;

        match Control::from_payload(frame.payload()) {
            Control::SlotQuery => {
                let current = self.clock.slot_at(now);
                debug!("{} asked for the current slot: {}", frame.node_id(), current);
                Ok(Some(self.reply(current, Control::CurrentSlot(current))))
            }
            Control::CurrentSlot(_) | Control::SlotAck(_) => {
                debug!("Ignoring hub-only control message from {}", frame.node_id());
                Ok(None)
            }
            Control::Data(_) => self.admit(frame, now, at),
        }
    }

    fn admit(&self, frame: Frame, now: SystemTime, at: Instant) -> Result<Option<Frame>> {
        let expected = self.clock.slot_at(now);
        if frame.slot_id() != expected {
            return Err(TdmaError::SlotMismatch { expected, actual: frame.slot_id() });
        }

        let sender = frame.node_id().clone();
        let slot_id = frame.slot_id();
        let fragment_id = frame.fragment_id();
        if let Some(payload) = self.assembler.feed(frame, at)? {
            self.deliver(Delivery { node_id: sender.clone(), slot_id, payload });
        }

        let assigned = match self.scheduler.allocate_at(&sender, 1, at) {
            Ok(assigned) => assigned,
            Err(TdmaError::NoSlotAvailable) => {
                warn!("No slot free for {}, frame accepted without an ack", sender);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if fragment_id != 0 {
            self.scheduler.mark_carrying(assigned, fragment_id)?;
        }
        debug!("Acknowledging {} with slot {}", sender, assigned);
        Ok(Some(self.reply(assigned, Control::SlotAck(assigned))))
    }

    fn reply(&self, slot_id: SlotId, control: Control) -> Frame {
        Frame::new(slot_id, self.node_id.clone(), control.to_payload())
    }

    fn deliver(&self, delivery: Delivery) {
        info!(
            "Received {} bytes from {} in slot {}",
            delivery.payload.len(),
            delivery.node_id,
            delivery.slot_id
        );
        match self.deliveries.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(d)) => {
                warn!("Delivery queue full, dropping {} bytes from {}", d.payload.len(), d.node_id)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("No delivery consumer, payload discarded")
            }
        }
    }

    /// Receive loop for one connection. Bad frames are logged and skipped;
    /// the loop ends when the connection fails.
    pub async fn serve_connection<T: Transport>(self: Arc<Self>, mut transport: T, peer: String) {
        info!("Serving {}", peer);
        loop {
            let frame = match transport.receive_frame(None).await {
                Ok(frame) => frame,
                Err(e) if e.is_connection_error() => {
                    info!("Connection from {} ended: {}", peer, e);
                    break;
                }
                Err(e) => {
                    debug!("Bad frame from {}: {}", peer, e);
                    continue;
                }
            };

            let reply = match self.handle_frame(frame, SystemTime::now(), Instant::now()) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Dropped frame from {}: {}", peer, e);
                    continue;
                }
            };
            if let Some(reply) = reply {
                if let Err(e) = transport.send_frame(&reply).await {
                    warn!("Reply to {} failed: {}", peer, e);
                    if e.is_connection_error() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = transport.disconnect().await {
            debug!("Disconnect from {} failed: {}", peer, e);
        }
    }

    /// Accepts connections until the listener fails, one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Hub {} listening on {}", self.node_id, listener.local_addr()?);
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let transport = match TcpTransport::from_stream(stream, self.link.clone(), self.max_frame_payload) {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("Could not set up connection from {}: {}", addr, e);
                    continue;
                }
            };
            tokio::spawn(Arc::clone(&self).serve_connection(transport, addr.to_string()));
        }
    }

    /// Spawns the slot ticker, aligned to the clock's next boundary, and the
    /// periodic eviction of stale reassemblies. The scheduler pointer is
    /// first moved to the clock's slot.
    pub fn start(&self) {
        let now = SystemTime::now();
        self.scheduler.align_to(self.clock.slot_at(now));
        let first_tick_in = self.clock.until_next_slot(now);
        let ticker = tokio::spawn(Arc::clone(&self.scheduler).run_ticker(first_tick_in));

        let assembler = Arc::clone(&self.assembler);
        let every = (assembler.timeout() / 2).max(Duration::from_millis(1));
        let evictor = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = assembler.evict_stale(Instant::now());
                if evicted > 0 {
                    debug!("Evicted {} stale reassemblies", evicted);
                }
            }
        });

        self.background.lock().extend([ticker, evictor]);
        info!(
            "Hub {} started: {} slots of {:?}",
            self.node_id,
            self.clock.total_slots(),
            self.clock.slot_duration()
        );
    }

    /// Stops the background tasks. Slot assignments are left as they are.
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        info!("Hub {} stopped", self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;
    use tdma_core::DEFAULT_EPOCH_UNIX_SECS;

    use crate::framing::FragmentPosition;

    const SLOT: Duration = Duration::from_secs(60);

    fn config() -> TdmaConfig {
        TdmaConfig {
            slot_duration_ms: SLOT.as_millis() as u64,
            ..Default::default()
        }
    }

    fn hub() -> (Arc<Hub>, mpsc::Receiver<Delivery>) {
        Hub::new(NodeId::new("SAT_001").unwrap(), &config(), LinkConfig::default()).unwrap()
    }

    /// A moment in the middle of `slot`.
    fn during(slot: SlotId) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(DEFAULT_EPOCH_UNIX_SECS) + SLOT * slot + SLOT / 2
    }

    fn station() -> NodeId {
        NodeId::new("GS_001").unwrap()
    }

    #[test]
    fn slot_query_is_answered_with_the_clock_slot() {
        let (hub, _rx) = hub();
        let query = Frame::new(0, station(), Control::SlotQuery.to_payload());

        let reply = hub.handle_frame(query, during(3), Instant::now()).unwrap().unwrap();
        assert_eq!(reply.slot_id(), 3);
        assert_eq!(reply.node_id().as_str(), "SAT_001");
        assert_eq!(Control::from_payload(reply.payload()), Control::CurrentSlot(3));
        assert!(hub.scheduler().snapshot().is_empty());
    }

    #[test]
    fn data_in_its_slot_is_delivered_and_acknowledged() {
        let (hub, mut rx) = hub();
        let data = Frame::new(4, station(), b"telemetry".to_vec());

        let reply = hub.handle_frame(data, during(4), Instant::now()).unwrap().unwrap();
        let Control::SlotAck(assigned) = Control::from_payload(reply.payload()) else {
            panic!("expected an ack, got {}", reply);
        };
        assert_eq!(reply.slot_id(), assigned);
        assert_eq!(hub.scheduler().snapshot()[&assigned], station());

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.node_id, station());
        assert_eq!(delivery.slot_id, 4);
        assert_eq!(delivery.payload, b"telemetry");
    }

    #[test]
    fn data_outside_its_slot_is_refused() {
        let (hub, mut rx) = hub();
        let data = Frame::new(2, station(), b"late".to_vec());

        let err = hub.handle_frame(data, during(5), Instant::now()).unwrap_err();
        assert!(matches!(err, TdmaError::SlotMismatch { expected: 5, actual: 2 }));
        assert!(err.is_frame_error());
        assert!(rx.try_recv().is_err());
        assert!(hub.scheduler().snapshot().is_empty());
    }

    #[test]
    fn corrupted_frame_is_refused() {
        let (hub, mut rx) = hub();
        let mut bytes = Frame::new(1, station(), b"payload".to_vec()).encode().unwrap().to_vec();
        let last_payload_byte = bytes.len() - 13;
        bytes[last_payload_byte] ^= 0xFF;
        let frame = Frame::decode(&bytes).unwrap();

        let err = hub.handle_frame(frame, during(1), Instant::now()).unwrap_err();
        assert!(matches!(err, TdmaError::ChecksumMismatch { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fragments_are_delivered_once_complete() {
        let (hub, mut rx) = hub();
        let now = Instant::now();
        let original: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let frames = FragmentAssembler::new(SLOT).split(&original, 1024, &station(), 6).unwrap();
        assert_eq!(frames.len(), 3);
        let fragment_id = frames[0].fragment_id();

        let mut acks = Vec::new();
        for frame in frames {
            assert!(rx.try_recv().is_err());
            let reply = hub.handle_frame(frame, during(6), now).unwrap().unwrap();
            acks.push(Control::from_payload(reply.payload()));
        }
        // same owner, same slot on every ack
        assert!(acks.windows(2).all(|w| w[0] == w[1]));

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.payload, original);
        assert_eq!(hub.assembler().pending(), 0);

        let Control::SlotAck(assigned) = acks[0] else { panic!("expected an ack") };
        assert_eq!(hub.scheduler().slot(assigned).unwrap().carried_fragment_id, fragment_id);
    }

    #[test]
    fn stray_fragment_with_bad_index_is_refused() {
        let (hub, _rx) = hub();
        let position = FragmentPosition { fragment_id: 9, index: 4, total: 2 };
        let frame = Frame::fragment(0, station(), position, b"x".to_vec());
        let err = hub.handle_frame(frame, during(0), Instant::now()).unwrap_err();
        assert!(matches!(err, TdmaError::InvalidFragment(_)));
        assert!(hub.scheduler().snapshot().is_empty());
    }

    #[test]
    fn hub_messages_from_stations_are_ignored() {
        let (hub, _rx) = hub();
        let ack = Frame::new(0, station(), Control::SlotAck(3).to_payload());
        assert!(hub.handle_frame(ack, during(0), Instant::now()).unwrap().is_none());
        assert!(hub.scheduler().snapshot().is_empty());
    }

    #[test]
    fn data_is_delivered_without_ack_when_the_ring_is_full() {
        let config = TdmaConfig {
            total_slots: 1,
            ..config()
        };
        let (hub, mut rx) = Hub::new(NodeId::new("SAT_001").unwrap(), &config, LinkConfig::default()).unwrap();
        let now = Instant::now();
        let first = NodeId::new("GS_A").unwrap();
        let second = NodeId::new("GS_B").unwrap();

        let reply = hub.handle_frame(Frame::new(0, first.clone(), b"a".to_vec()), during(0), now).unwrap();
        assert_eq!(Control::from_payload(reply.unwrap().payload()), Control::SlotAck(0));

        let reply = hub.handle_frame(Frame::new(0, second.clone(), b"b".to_vec()), during(0), now).unwrap();
        assert!(reply.is_none());

        assert_eq!(rx.try_recv().unwrap().node_id, first);
        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.node_id, second);
        assert_eq!(delivery.payload, b"b");
        assert_eq!(hub.scheduler().snapshot()[&0], first);
    }

    #[tokio::test]
    async fn start_realigns_the_pointer_with_the_clock() {
        let (hub, _rx) = hub();
        hub.scheduler().tick();
        assert_ne!(hub.scheduler().current_slot(), hub.clock().current_slot());

        hub.start();
        assert_eq!(hub.scheduler().current_slot(), hub.clock().current_slot());
        hub.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn background_tasks_stop_on_shutdown() {
        let config = TdmaConfig {
            slot_duration_ms: 1000,
            ..Default::default()
        };
        let (hub, _rx) = Hub::new(NodeId::new("SAT_001").unwrap(), &config, LinkConfig::default()).unwrap();
        let start = hub.scheduler().current_slot();

        hub.start();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let moved = hub.scheduler().current_slot();
        assert_ne!(moved, start);

        hub.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hub.scheduler().current_slot(), moved);
    }
}
