//! Slot table for the hub: allocation, eviction and the current-slot pointer

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace};
use parking_lot::Mutex;
use tdma_core::{FragmentId, NodeId, Result, SlotId, TdmaConfig, TdmaError};
use tokio::time::{interval_at, Instant};

/// An owner keeps its slot on re-allocation while the grant is younger than this many slots.
const REUSE_WINDOW_SLOTS: u32 = 10;
/// An assignment older than this many slots may be taken over when the table is full.
const PREEMPT_AFTER_SLOTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Assigned { owner: NodeId, assigned_at: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    pub id: SlotId,
    pub state: SlotState,
    /// Bookkeeping only; the last fragment group seen in this slot.
    pub carried_fragment_id: FragmentId,
}

impl SlotRecord {
    fn free(id: SlotId) -> Self {
        Self { id, state: SlotState::Free, carried_fragment_id: 0 }
    }

    pub fn is_free(&self) -> bool {
        matches!(self.state, SlotState::Free)
    }

    pub fn owner(&self) -> Option<&NodeId> {
        match &self.state {
            SlotState::Assigned { owner, .. } => Some(owner),
            SlotState::Free => None,
        }
    }

    fn assign(&mut self, owner: NodeId, now: Instant) {
        self.state = SlotState::Assigned { owner, assigned_at: now };
        self.carried_fragment_id = 0;
    }

    fn clear(&mut self) {
        self.state = SlotState::Free;
        self.carried_fragment_id = 0;
    }
}

struct Table {
    slots: Box<[SlotRecord]>,
    current: SlotId,
}

/// Fixed ring of `total_slots` records behind one lock. Every operation takes
/// the lock for its whole duration and never awaits while holding it.
pub struct SlotScheduler {
    total_slots: u32,
    slot_duration: Duration,
    table: Mutex<Table>,
}

impl SlotScheduler {
    pub fn new(total_slots: u32, slot_duration: Duration) -> Result<Self> {
        Self::starting_at(total_slots, slot_duration, 0)
    }

    /// Starts the pointer at `current`, e.g. the slot the clock reports at hub start.
    pub fn starting_at(total_slots: u32, slot_duration: Duration, current: SlotId) -> Result<Self> {
        if total_slots == 0 {
            return Err(TdmaError::InvalidConfiguration("total slots must be > 0".into()));
        }
        if slot_duration.is_zero() {
            return Err(TdmaError::InvalidConfiguration("slot duration must be > 0".into()));
        }
        if current >= total_slots {
            return Err(TdmaError::InvalidSlotId(current));
        }
        let slots = (0..total_slots).map(SlotRecord::free).collect();
        Ok(Self {
            total_slots,
            slot_duration,
            table: Mutex::new(Table { slots, current }),
        })
    }

    pub fn from_config(config: &TdmaConfig) -> Result<Self> {
        Self::new(config.total_slots, config.slot_duration())
    }

    pub fn total_slots(&self) -> u32 {
        self.total_slots
    }

    pub fn slot_duration(&self) -> Duration {
        self.slot_duration
    }

    /// `priority` does not influence the choice yet.
    pub fn allocate(&self, node_id: &NodeId, priority: u8) -> Result<SlotId> {
        self.allocate_at(node_id, priority, Instant::now())
    }

    /// Allocation policy, first match wins:
    ///
    /// 1. the node's own assignment, if younger than 10 slot durations
    ///    (older ones are released on the way);
    /// 2. the slot under the pointer, the one after it, then the rest of the
    ///    ring in order;
    /// 3. the oldest assignment, if older than 5 slot durations.
    ///
    /// Fails with `NoSlotAvailable` without touching the table.
    pub fn allocate_at(&self, node_id: &NodeId, priority: u8, now: Instant) -> Result<SlotId> {
        trace!("Allocating for {} (priority {})", node_id, priority);
        let reuse_window = self.slot_duration * REUSE_WINDOW_SLOTS;
        let mut table = self.table.lock();

        for slot in table.slots.iter_mut() {
            let fresh = match &slot.state {
                SlotState::Assigned { owner, assigned_at } if owner == node_id => {
                    now.saturating_duration_since(*assigned_at) < reuse_window
                }
                _ => continue,
            };
            if fresh {
                trace!("{} already holds slot {}", node_id, slot.id);
                return Ok(slot.id);
            }
            debug!("Releasing expired slot {} held by {}", slot.id, node_id);
            slot.clear();
        }

        let start = table.current;
        let free = (0..self.total_slots)
            .map(|offset| ring(start, offset, self.total_slots))
            .find(|&id| table.slots[id as usize].is_free());
        if let Some(id) = free {
            table.slots[id as usize].assign(node_id.clone(), now);
            debug!("Assigned slot {} to {} (pointer at {})", id, node_id, start);
            return Ok(id);
        }

        let oldest = table
            .slots
            .iter()
            .filter_map(|slot| match &slot.state {
                SlotState::Assigned { assigned_at, .. } => Some((slot.id, *assigned_at)),
                SlotState::Free => None,
            })
            .min_by_key(|&(_, assigned_at)| assigned_at);
        if let Some((id, assigned_at)) = oldest {
            if now.saturating_duration_since(assigned_at) > self.slot_duration * PREEMPT_AFTER_SLOTS {
                let slot = &mut table.slots[id as usize];
                info!(
                    "Preempting slot {} from {} for {}",
                    id,
                    slot.owner().map(NodeId::as_str).unwrap_or("?"),
                    node_id
                );
                slot.assign(node_id.clone(), now);
                return Ok(id);
            }
        }

        debug!("No slot available for {}", node_id);
        Err(TdmaError::NoSlotAvailable)
    }

    pub fn allocate_consecutive(&self, node_id: &NodeId, count: usize) -> Result<Vec<SlotId>> {
        self.allocate_consecutive_at(node_id, count, Instant::now())
    }

    /// First-fit window of `count` free slots in id order, without wrapping.
    /// All of the window is assigned or none of it.
    pub fn allocate_consecutive_at(
        &self,
        node_id: &NodeId,
        count: usize,
        now: Instant,
    ) -> Result<Vec<SlotId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut table = self.table.lock();
        let start = table
            .slots
            .windows(count)
            .position(|window| window.iter().all(SlotRecord::is_free))
            .ok_or(TdmaError::InsufficientConsecutiveSlots { requested: count })?;

        let window = &mut table.slots[start..start + count];
        for slot in window.iter_mut() {
            slot.assign(node_id.clone(), now);
        }
        let ids: Vec<SlotId> = window.iter().map(|slot| slot.id).collect();
        debug!("Assigned consecutive slots {:?} to {}", ids, node_id);
        Ok(ids)
    }

    pub fn release(&self, slot_id: SlotId) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table
            .slots
            .get_mut(slot_id as usize)
            .ok_or(TdmaError::InvalidSlotId(slot_id))?;
        slot.clear();
        debug!("Released slot {}", slot_id);
        Ok(())
    }

    /// Advances the pointer by one and returns its new position.
    pub fn tick(&self) -> SlotId {
        let mut table = self.table.lock();
        table.current = ring(table.current, 1, self.total_slots);
        table.current
    }

    pub fn current_slot(&self) -> SlotId {
        self.table.lock().current
    }

    /// Moves the pointer to `slot_id`, wrapped into the ring.
    pub fn align_to(&self, slot_id: SlotId) {
        let mut table = self.table.lock();
        let aligned = slot_id % self.total_slots;
        if table.current != aligned {
            debug!("Pointer moved from {} to {}", table.current, aligned);
            table.current = aligned;
        }
    }

    /// Owners of all assigned slots.
    pub fn snapshot(&self) -> BTreeMap<SlotId, NodeId> {
        self.table
            .lock()
            .slots
            .iter()
            .filter_map(|slot| slot.owner().map(|owner| (slot.id, owner.clone())))
            .collect()
    }

    pub fn slot(&self, slot_id: SlotId) -> Result<SlotRecord> {
        self.table
            .lock()
            .slots
            .get(slot_id as usize)
            .cloned()
            .ok_or(TdmaError::InvalidSlotId(slot_id))
    }

    /// Lowest free slot id.
    pub fn next_available_slot(&self) -> Option<SlotId> {
        self.table.lock().slots.iter().find(|slot| slot.is_free()).map(|slot| slot.id)
    }

    /// Records which fragment group an assigned slot is carrying.
    pub fn mark_carrying(&self, slot_id: SlotId, fragment_id: FragmentId) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table
            .slots
            .get_mut(slot_id as usize)
            .ok_or(TdmaError::InvalidSlotId(slot_id))?;
        if !slot.is_free() {
            slot.carried_fragment_id = fragment_id;
        }
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let table = self.table.lock();
        SchedulerStatus {
            current: table.current,
            slot_duration: self.slot_duration,
            slots: table.slots.to_vec(),
        }
    }

    /// Calls [`SlotScheduler::tick`] once per slot duration, the first time
    /// after `first_tick_in`. Runs until its task is aborted; aborting leaves
    /// existing assignments untouched.
    pub async fn run_ticker(self: Arc<Self>, first_tick_in: Duration) {
        let mut ticker = interval_at(Instant::now() + first_tick_in, self.slot_duration);
        info!(
            "Slot ticker started: {} slots of {:?}, first tick in {:?}",
            self.total_slots, self.slot_duration, first_tick_in
        );
        loop {
            ticker.tick().await;
            let current = self.tick();
            trace!("Slot pointer at {}", current);
        }
    }
}

fn ring(start: SlotId, offset: u32, total: u32) -> SlotId {
    ((u64::from(start) + u64::from(offset)) % u64::from(total)) as SlotId
}

/// Point-in-time copy of the table for printing.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub current: SlotId,
    pub slot_duration: Duration,
    pub slots: Vec<SlotRecord>,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "current slot {} of {} ({:?} each)",
            self.current,
            self.slots.len(),
            self.slot_duration
        )?;
        for slot in &self.slots {
            match slot.owner() {
                Some(owner) => writeln!(f, "  slot {:>3}: ASSIGNED to {}", slot.id, owner)?,
                None => writeln!(f, "  slot {:>3}: FREE", slot.id)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn scheduler() -> SlotScheduler {
        SlotScheduler::new(10, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn allocation_follows_the_pointer() {
        let s = scheduler();
        for _ in 0..3 {
            s.tick();
        }
        assert_eq!(s.current_slot(), 3);

        assert_eq!(s.allocate(&node("A"), 1).unwrap(), 3);
        assert_eq!(s.allocate(&node("B"), 1).unwrap(), 4);
        s.release(3).unwrap();
        assert_eq!(s.allocate(&node("C"), 1).unwrap(), 3);

        let snapshot = s.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[&3], node("C"));
        assert_eq!(snapshot[&4], node("B"));
    }

    #[test]
    fn reallocation_within_window_is_idempotent() {
        let s = scheduler();
        let t0 = Instant::now();
        let first = s.allocate_at(&node("A"), 1, t0).unwrap();
        let again = s.allocate_at(&node("A"), 1, t0 + Duration::from_secs(9)).unwrap();
        assert_eq!(first, again);
        assert_eq!(s.snapshot().len(), 1);
    }

    #[test]
    fn expired_ownership_is_released_before_reallocating() {
        let s = scheduler();
        let t0 = Instant::now();
        assert_eq!(s.allocate_at(&node("A"), 1, t0).unwrap(), 0);
        s.tick();

        let id = s.allocate_at(&node("A"), 1, t0 + Duration::from_secs(10)).unwrap();
        assert_eq!(id, 1);
        assert!(s.slot(0).unwrap().is_free());
        assert_eq!(s.snapshot().len(), 1);
    }

    #[test]
    fn scan_wraps_around_the_ring() {
        let s = SlotScheduler::starting_at(4, Duration::from_secs(1), 2).unwrap();
        let t0 = Instant::now();
        assert_eq!(s.allocate_at(&node("A"), 1, t0).unwrap(), 2);
        assert_eq!(s.allocate_at(&node("B"), 1, t0).unwrap(), 3);
        assert_eq!(s.allocate_at(&node("C"), 1, t0).unwrap(), 0);
        assert_eq!(s.allocate_at(&node("D"), 1, t0).unwrap(), 1);
    }

    #[test]
    fn full_table_preempts_only_stale_owners() {
        let s = scheduler();
        let t0 = Instant::now();
        for i in 0..10u64 {
            let id = s.allocate_at(&node(&format!("N{}", i)), 1, t0 + Duration::from_millis(i)).unwrap();
            assert_eq!(id, i as u32);
        }
        let before = s.snapshot();

        let err = s.allocate_at(&node("X"), 1, t0 + Duration::from_secs(3)).unwrap_err();
        assert!(matches!(err, TdmaError::NoSlotAvailable));
        assert_eq!(s.snapshot(), before);

        let id = s.allocate_at(&node("X"), 1, t0 + Duration::from_secs(6)).unwrap();
        assert_eq!(id, 0);
        assert_eq!(s.snapshot()[&0], node("X"));
    }

    #[test]
    fn consecutive_windows_are_first_fit_and_atomic() {
        let s = scheduler();
        assert_eq!(s.allocate_consecutive(&node("X"), 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(s.allocate_consecutive(&node("Y"), 3).unwrap(), vec![3, 4, 5]);

        let before = s.snapshot();
        let err = s.allocate_consecutive(&node("Z"), 8).unwrap_err();
        assert!(matches!(err, TdmaError::InsufficientConsecutiveSlots { requested: 8 }));
        assert_eq!(s.snapshot(), before);

        // the four remaining slots do not wrap into slot 0
        s.release(0).unwrap();
        assert!(s.allocate_consecutive(&node("Z"), 5).is_err());
        assert_eq!(s.allocate_consecutive(&node("Z"), 4).unwrap(), vec![6, 7, 8, 9]);
    }

    #[test]
    fn release_checks_range_and_clears_bookkeeping() {
        let s = scheduler();
        let id = s.allocate(&node("A"), 1).unwrap();
        s.mark_carrying(id, 42).unwrap();
        assert_eq!(s.slot(id).unwrap().carried_fragment_id, 42);

        s.release(id).unwrap();
        let slot = s.slot(id).unwrap();
        assert!(slot.is_free());
        assert_eq!(slot.owner(), None);
        assert_eq!(slot.carried_fragment_id, 0);

        assert!(matches!(s.release(10), Err(TdmaError::InvalidSlotId(10))));
        assert!(matches!(s.slot(99), Err(TdmaError::InvalidSlotId(99))));
    }

    #[test]
    fn align_moves_the_pointer_and_wraps() {
        let s = SlotScheduler::new(4, Duration::from_secs(1)).unwrap();
        s.align_to(3);
        assert_eq!(s.current_slot(), 3);
        s.align_to(6);
        assert_eq!(s.current_slot(), 2);
        assert_eq!(s.allocate(&node("A"), 1).unwrap(), 2);
    }

    #[test]
    fn tick_wraps() {
        let s = SlotScheduler::new(3, Duration::from_secs(1)).unwrap();
        assert_eq!((s.tick(), s.tick(), s.tick()), (1, 2, 0));
    }

    #[test]
    fn invalid_construction() {
        assert!(matches!(
            SlotScheduler::new(0, Duration::from_secs(1)),
            Err(TdmaError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            SlotScheduler::new(4, Duration::ZERO),
            Err(TdmaError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            SlotScheduler::starting_at(4, Duration::from_secs(1), 4),
            Err(TdmaError::InvalidSlotId(4))
        ));
    }

    #[test]
    fn concurrent_allocations_never_share_a_slot() {
        let s = Arc::new(scheduler());
        let ids: Vec<SlotId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let s = Arc::clone(&s);
                    scope.spawn(move || s.allocate(&node(&format!("GS_{}", i)), 1).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 8);
        assert_eq!(s.snapshot().len(), 8);
        assert_eq!(s.next_available_slot(), Some(8));
    }

    #[test]
    fn status_lists_every_slot() {
        let s = SlotScheduler::new(3, Duration::from_secs(1)).unwrap();
        s.allocate(&node("A"), 1).unwrap();
        let text = s.status().to_string();
        assert!(text.contains("slot   0: ASSIGNED to A"));
        assert!(text.contains("slot   2: FREE"));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_advances_once_per_slot_until_aborted() {
        let s = Arc::new(scheduler());
        let handle = tokio::spawn(Arc::clone(&s).run_ticker(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(s.current_slot(), 3);

        let id = s.allocate(&node("A"), 1).unwrap();
        handle.abort();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(s.current_slot(), 3);
        assert_eq!(s.snapshot()[&id], node("A"));
    }
}
