//! Epoch-based slot clock.
//!
//! Every node maps wall-clock time to a slot index on its own; nodes whose
//! clocks agree compute the same index without exchanging a message. Clock
//! synchronisation itself is assumed to come from an external time source.

use std::time::{Duration, SystemTime};

use crate::config::TdmaConfig;
use crate::error::{Result, TdmaError};
use crate::types::SlotId;

/// `floor((now - epoch) / slot_duration) mod total_slots`.
pub fn compute_slot(
    now: SystemTime,
    epoch: SystemTime,
    slot_duration: Duration,
    total_slots: u32,
) -> Result<SlotId> {
    check(slot_duration, total_slots)?;
    let slot_nanos = slot_duration.as_nanos() as i128;
    let index = elapsed_nanos(now, epoch).div_euclid(slot_nanos);
    Ok(index.rem_euclid(total_slots as i128) as SlotId)
}

fn check(slot_duration: Duration, total_slots: u32) -> Result<()> {
    if slot_duration.is_zero() {
        return Err(TdmaError::InvalidConfiguration("slot duration must be > 0".into()));
    }
    if total_slots == 0 {
        return Err(TdmaError::InvalidConfiguration("total slots must be > 0".into()));
    }
    Ok(())
}

// Signed, so instants before the epoch keep the ramp continuous.
fn elapsed_nanos(now: SystemTime, epoch: SystemTime) -> i128 {
    match now.duration_since(epoch) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotClock {
    epoch: SystemTime,
    slot_duration: Duration,
    total_slots: u32,
}

impl SlotClock {
    pub fn new(epoch: SystemTime, slot_duration: Duration, total_slots: u32) -> Result<Self> {
        check(slot_duration, total_slots)?;
        Ok(Self { epoch, slot_duration, total_slots })
    }

    pub fn from_config(config: &TdmaConfig) -> Result<Self> {
        Self::new(config.epoch(), config.slot_duration(), config.total_slots)
    }

    pub fn slot_at(&self, now: SystemTime) -> SlotId {
        let slot_nanos = self.slot_duration.as_nanos() as i128;
        elapsed_nanos(now, self.epoch)
            .div_euclid(slot_nanos)
            .rem_euclid(self.total_slots as i128) as SlotId
    }

    pub fn current_slot(&self) -> SlotId {
        self.slot_at(SystemTime::now())
    }

    /// Time left until the next slot boundary.
    pub fn until_next_slot(&self, now: SystemTime) -> Duration {
        let slot_nanos = self.slot_duration.as_nanos() as i128;
        let into_slot = elapsed_nanos(now, self.epoch).rem_euclid(slot_nanos);
        Duration::from_nanos((slot_nanos - into_slot) as u64)
    }

    /// One full turn of the ring.
    pub fn period(&self) -> Duration {
        self.slot_duration * self.total_slots
    }

    pub fn slot_duration(&self) -> Duration {
        self.slot_duration
    }

    pub fn total_slots(&self) -> u32 {
        self.total_slots
    }

    pub fn epoch(&self) -> SystemTime {
        self.epoch
    }
}
