//! Error type shared by every layer of the TDMA link.

use std::io;

use thiserror::Error;

use crate::types::SlotId;

pub type Result<T> = std::result::Result<T, TdmaError>;

#[derive(Debug, Error)]
pub enum TdmaError {
    // Frame codec
    #[error("invalid frame header sentinel")]
    InvalidHeader,

    #[error("invalid frame footer sentinel")]
    InvalidFooter,

    #[error("checksum mismatch: frame carries {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("length mismatch: header declares {declared} payload bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid fragment: {0}")]
    InvalidFragment(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("frame claims slot {actual} but the current slot is {expected}")]
    SlotMismatch { expected: SlotId, actual: SlotId },

    // Scheduler
    #[error("no time slot available")]
    NoSlotAvailable,

    #[error("no window of {requested} consecutive free slots")]
    InsufficientConsecutiveSlots { requested: usize },

    #[error("slot id {0} is out of range")]
    InvalidSlotId(SlotId),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // Transport
    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("transport is not connected")]
    NotConnected,

    #[error("socket io error: {0}")]
    Io(#[from] io::Error),
}

impl TdmaError {
    /// Failures confined to one frame. A receive loop logs these and keeps going.
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            TdmaError::InvalidHeader
                | TdmaError::InvalidFooter
                | TdmaError::ChecksumMismatch { .. }
                | TdmaError::LengthMismatch { .. }
                | TdmaError::TooShort { .. }
                | TdmaError::PayloadTooLarge { .. }
                | TdmaError::InvalidFragment(_)
                | TdmaError::InvalidNodeId(_)
                | TdmaError::SlotMismatch { .. }
        )
    }

    /// Failures that end the task serving one connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TdmaError::ConnectionClosed | TdmaError::Timeout | TdmaError::NotConnected | TdmaError::Io(_)
        )
    }
}
