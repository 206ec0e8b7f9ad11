//! Splitting oversized payloads into frames and putting them back together

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use rand::Rng;
use tdma_core::{FragmentId, NodeId, Result, SlotId, TdmaConfig, TdmaError};
use tokio::time::Instant;

use crate::framing::{FragmentPosition, Frame};

struct Assembly {
    expected_total: u16,
    pieces: BTreeMap<u16, Vec<u8>>,
    first_seen: Instant,
}

/// Fragmentation on the sending side and reassembly on the receiving side.
///
/// Open assemblies live behind their own lock, independent of the slot
/// scheduler. Nothing is evicted implicitly: the owner calls
/// [`FragmentAssembler::evict_stale`] on its own schedule.
pub struct FragmentAssembler {
    timeout: Duration,
    assemblies: Mutex<HashMap<FragmentId, Assembly>>,
    next_fragment_id: AtomicU32,
}

impl FragmentAssembler {
    pub fn new(timeout: Duration) -> Self {
        let seed = rand::rng().random_range(1..=u32::MAX);
        Self {
            timeout,
            assemblies: Mutex::new(HashMap::new()),
            next_fragment_id: AtomicU32::new(seed),
        }
    }

    pub fn from_config(config: &TdmaConfig) -> Self {
        Self::new(config.fragment_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // 0 marks an unfragmented frame and is never handed out.
    fn fresh_fragment_id(&self) -> FragmentId {
        loop {
            let id = self.next_fragment_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Chunks `payload` into frames of at most `max_fragment_payload` bytes.
    /// A payload that fits in one piece becomes a single unfragmented frame.
    pub fn split(
        &self,
        payload: &[u8],
        max_fragment_payload: usize,
        node_id: &NodeId,
        slot_id: SlotId,
    ) -> Result<Vec<Frame>> {
        if max_fragment_payload == 0 {
            return Err(TdmaError::InvalidConfiguration(
                "fragment payload size must be > 0".into(),
            ));
        }
        if payload.len() <= max_fragment_payload {
            return Ok(vec![Frame::new(slot_id, node_id.clone(), payload.to_vec())]);
        }

        let pieces = payload.len().div_ceil(max_fragment_payload);
        let total = u16::try_from(pieces).map_err(|_| TdmaError::PayloadTooLarge {
            size: payload.len(),
            max: max_fragment_payload * u16::MAX as usize,
        })?;
        let fragment_id = self.fresh_fragment_id();

        let frames: Vec<Frame> = payload
            .chunks(max_fragment_payload)
            .enumerate()
            .map(|(index, chunk)| {
                let position = FragmentPosition { fragment_id, index: index as u16, total };
                Frame::fragment(slot_id, node_id.clone(), position, chunk.to_vec())
            })
            .collect();

        debug!(
            "Split {} bytes into {} fragments of <= {} bytes (fragment id {})",
            payload.len(),
            total,
            max_fragment_payload,
            fragment_id
        );
        Ok(frames)
    }

    /// Stores one fragment and returns the whole payload once every index is present.
    /// Unfragmented frames are handed straight back. A repeated index overwrites
    /// the earlier copy.
    pub fn feed(&self, frame: Frame, now: Instant) -> Result<Option<Vec<u8>>> {
        if !frame.is_fragment() {
            return Ok(Some(frame.into_payload()));
        }

        let fragment_id = frame.fragment_id();
        let index = frame.fragment_index();
        let total = frame.total_fragments();
        if total == 0 || index >= total {
            return Err(TdmaError::InvalidFragment(format!(
                "index {} outside 0..{} (fragment id {})",
                index, total, fragment_id
            )));
        }

        let mut assemblies = self.assemblies.lock();
        let assembly = assemblies.entry(fragment_id).or_insert_with(|| Assembly {
            expected_total: total,
            pieces: BTreeMap::new(),
            first_seen: now,
        });
        if assembly.expected_total != total {
            warn!(
                "Fragment {} of id {} claims {} fragments, assembly expects {}",
                index, fragment_id, total, assembly.expected_total
            );
            return Err(TdmaError::InvalidFragment(format!(
                "total {} disagrees with {} for fragment id {}",
                total, assembly.expected_total, fragment_id
            )));
        }

        if assembly.pieces.insert(index, frame.into_payload()).is_some() {
            trace!("Fragment {}/{} of id {} replaced an earlier copy", index + 1, total, fragment_id);
        }
        trace!(
            "Holding {}/{} fragments of id {}",
            assembly.pieces.len(),
            total,
            fragment_id
        );

        if assembly.pieces.len() < total as usize {
            return Ok(None);
        }

        let assembly = match assemblies.remove(&fragment_id) {
            Some(assembly) => assembly,
            None => return Ok(None),
        };
        let size = assembly.pieces.values().map(Vec::len).sum();
        let mut payload = Vec::with_capacity(size);
        for piece in assembly.pieces.into_values() {
            payload.extend_from_slice(&piece);
        }
        debug!("Reassembled {} bytes from {} fragments (id {})", payload.len(), total, fragment_id);
        Ok(Some(payload))
    }

    /// Drops every assembly first seen longer than the timeout ago.
    pub fn evict_stale(&self, now: Instant) -> usize {
        let mut assemblies = self.assemblies.lock();
        let before = assemblies.len();
        assemblies.retain(|id, assembly| {
            if now.saturating_duration_since(assembly.first_seen) > self.timeout {
                warn!(
                    "Dropping incomplete message (fragment id {}), received {}/{} fragments",
                    id,
                    assembly.pieces.len(),
                    assembly.expected_total
                );
                false
            } else {
                true
            }
        });
        before - assemblies.len()
    }

    pub fn pending(&self) -> usize {
        self.assemblies.lock().len()
    }

    pub fn contains(&self, fragment_id: FragmentId) -> bool {
        self.assemblies.lock().contains_key(&fragment_id)
    }
}
