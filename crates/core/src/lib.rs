//! Core types for the TDMA link: configuration, identifiers, errors and the slot clock

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{compute_slot, SlotClock};
pub use config::{TdmaConfig, DEFAULT_EPOCH_UNIX_SECS};
pub use error::{Result, TdmaError};
pub use types::{FragmentId, NodeId, SlotId, NODE_ID_LEN};
