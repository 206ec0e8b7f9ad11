//! Wire frame layout and codec.
//!
//! Big-endian, fixed layout except for the payload:
//!
//! ```text
//! header(8) slot_id(4) node_id(32) length(4) fragment_id(4)
//! total_fragments(2) fragment_index(2) flags(2) payload(length)
//! checksum(4) footer(8)
//! ```

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tdma_core::{FragmentId, NodeId, Result, SlotId, TdmaError, NODE_ID_LEN};

pub const FRAME_HEADER: [u8; 8] = [0xAA, 0x55, 0xAA, 0x55, 0xAA, 0x55, 0xAA, 0x55];
pub const FRAME_FOOTER: [u8; 8] = [0x55, 0xAA, 0x55, 0xAA, 0x55, 0xAA, 0x55, 0xAA];

/// Bytes before the payload. A receiver reads exactly this much to learn `length`.
pub const FIXED_PREFIX_LEN: usize = 8 + 4 + NODE_ID_LEN + 4 + 4 + 2 + 2 + 2;
/// Checksum plus footer.
pub const TRAILER_LEN: usize = 4 + 8;
/// Every fixed field with an empty payload. Peers quoting "60 bytes plus
/// payload" undercount the node id field; anything shorter than this is `TooShort`.
pub const MIN_FRAME_LEN: usize = FIXED_PREFIX_LEN + TRAILER_LEN;
/// Offset of the big-endian `length` field.
pub const LENGTH_OFFSET: usize = 8 + 4 + NODE_ID_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const EMPTY: Self = Self(0);
    pub const FRAGMENT: Self = Self(0x0001);
    pub const FIRST_FRAGMENT: Self = Self(0x0002);
    pub const LAST_FRAGMENT: Self = Self(0x0004);
    pub const NEED_ACK: Self = Self(0x0008);

    /// Unknown bits are kept so the checksum still matches what the sender computed.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Where a fragment sits inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentPosition {
    pub fragment_id: FragmentId,
    pub index: u16,
    pub total: u16,
}

/// One frame on the wire. Immutable once built; the constructors fill in
/// `length` and `checksum`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: [u8; 8],
    slot_id: SlotId,
    node_id: NodeId,
    length: u32,
    fragment_id: FragmentId,
    total_fragments: u16,
    fragment_index: u16,
    flags: FrameFlags,
    payload: Vec<u8>,
    checksum: u32,
    footer: [u8; 8],
}

impl Frame {
    /// Non-fragmented frame.
    pub fn new(slot_id: SlotId, node_id: NodeId, payload: impl Into<Vec<u8>>) -> Self {
        Self::build(
            slot_id,
            node_id,
            FragmentPosition { fragment_id: 0, index: 0, total: 1 },
            FrameFlags::EMPTY,
            payload.into(),
        )
    }

    /// One piece of a fragmented payload. First/last flags follow from the position.
    pub fn fragment(
        slot_id: SlotId,
        node_id: NodeId,
        position: FragmentPosition,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let mut flags = FrameFlags::FRAGMENT;
        if position.index == 0 {
            flags.insert(FrameFlags::FIRST_FRAGMENT);
        }
        if position.index.checked_add(1) == Some(position.total) {
            flags.insert(FrameFlags::LAST_FRAGMENT);
        }
        Self::build(slot_id, node_id, position, flags, payload.into())
    }

    fn build(
        slot_id: SlotId,
        node_id: NodeId,
        position: FragmentPosition,
        flags: FrameFlags,
        payload: Vec<u8>,
    ) -> Self {
        // Oversized payloads saturate here and are refused by `encode`.
        let length = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        let mut frame = Self {
            header: FRAME_HEADER,
            slot_id,
            node_id,
            length,
            fragment_id: position.fragment_id,
            total_fragments: position.total,
            fragment_index: position.index,
            flags,
            payload,
            checksum: 0,
            footer: FRAME_FOOTER,
        };
        frame.checksum = frame.compute_checksum();
        frame
    }

    pub fn with_need_ack(mut self) -> Self {
        self.flags.insert(FrameFlags::NEED_ACK);
        self.checksum = self.compute_checksum();
        self
    }

    pub fn header(&self) -> &[u8; 8] {
        &self.header
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn fragment_id(&self) -> FragmentId {
        self.fragment_id
    }

    pub fn total_fragments(&self) -> u16 {
        self.total_fragments
    }

    pub fn fragment_index(&self) -> u16 {
        self.fragment_index
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn footer(&self) -> &[u8; 8] {
        &self.footer
    }

    pub fn is_fragment(&self) -> bool {
        self.flags.contains(FrameFlags::FRAGMENT)
    }

    pub fn is_first_fragment(&self) -> bool {
        self.flags.contains(FrameFlags::FIRST_FRAGMENT)
    }

    pub fn is_last_fragment(&self) -> bool {
        self.flags.contains(FrameFlags::LAST_FRAGMENT)
    }

    pub fn needs_ack(&self) -> bool {
        self.flags.contains(FrameFlags::NEED_ACK)
    }

    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN + self.payload.len()
    }

    fn compute_checksum(&self) -> u32 {
        checksum(
            &self.header,
            self.slot_id,
            self.total_fragments,
            self.fragment_index,
            self.flags.bits(),
            &self.payload,
        )
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > u32::MAX as usize || self.length as usize != self.payload.len() {
            return Err(TdmaError::PayloadTooLarge {
                size: self.payload.len(),
                max: u32::MAX as usize,
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.header);
        buf.put_u32(self.slot_id);
        buf.put_slice(&self.node_id.to_wire());
        buf.put_u32(self.length);
        buf.put_u32(self.fragment_id);
        buf.put_u16(self.total_fragments);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.flags.bits());
        buf.put_slice(&self.payload);
        buf.put_u32(self.checksum);
        buf.put_slice(&self.footer);
        Ok(buf.freeze())
    }

    /// Parses one complete frame. Sentinels and checksum are not checked here;
    /// see [`Frame::validate`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(TdmaError::TooShort { len: bytes.len(), min: MIN_FRAME_LEN });
        }

        let mut buf = bytes;
        let mut header = [0u8; 8];
        buf.copy_to_slice(&mut header);
        let slot_id = buf.get_u32();
        let mut raw_node = [0u8; NODE_ID_LEN];
        buf.copy_to_slice(&mut raw_node);
        let length = buf.get_u32();
        let fragment_id = buf.get_u32();
        let total_fragments = buf.get_u16();
        let fragment_index = buf.get_u16();
        let flags = FrameFlags::from_bits(buf.get_u16());

        let declared = length as usize;
        let actual = buf.remaining() - TRAILER_LEN;
        if actual != declared {
            return Err(TdmaError::LengthMismatch { declared, actual });
        }

        let payload = buf[..declared].to_vec();
        buf.advance(declared);
        let checksum = buf.get_u32();
        let mut footer = [0u8; 8];
        buf.copy_to_slice(&mut footer);

        Ok(Self {
            header,
            slot_id,
            node_id: NodeId::from_wire(&raw_node)?,
            length,
            fragment_id,
            total_fragments,
            fragment_index,
            flags,
            payload,
            checksum,
            footer,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.header != FRAME_HEADER {
            return Err(TdmaError::InvalidHeader);
        }
        if self.footer != FRAME_FOOTER {
            return Err(TdmaError::InvalidFooter);
        }
        let computed = self.compute_checksum();
        if computed != self.checksum {
            return Err(TdmaError::ChecksumMismatch { stored: self.checksum, computed });
        }
        if self.length as usize != self.payload.len() {
            return Err(TdmaError::LengthMismatch {
                declared: self.length as usize,
                actual: self.payload.len(),
            });
        }
        Ok(())
    }

    /// `decode` followed by `validate`.
    pub fn decode_valid(bytes: &[u8]) -> Result<Self> {
        let frame = Self::decode(bytes)?;
        frame.validate()?;
        Ok(frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame{{slot: {}, node: {}, len: {}, fragment: {}, {}/{}, flags: {:#06x}}}",
            self.slot_id,
            self.node_id,
            self.length,
            self.fragment_id,
            self.fragment_index,
            self.total_fragments,
            self.flags.bits()
        )
    }
}

/// Rolling shift/XOR over the header, slot id, fragment position, flags and
/// payload. Not a CRC: bytes that are shifted past bit 31 stop contributing,
/// and node id, length and fragment id are not covered at all.
pub fn checksum(
    header: &[u8; 8],
    slot_id: SlotId,
    total_fragments: u16,
    fragment_index: u16,
    flags: u16,
    payload: &[u8],
) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in header {
        crc = (crc << 1) ^ u32::from(b);
    }
    crc = (crc << 1) ^ slot_id;
    crc = (crc << 1) ^ u32::from(total_fragments);
    crc = (crc << 1) ^ u32::from(fragment_index);
    crc = (crc << 1) ^ u32::from(flags);
    for &b in payload {
        crc = (crc << 1) ^ u32::from(b);
    }
    crc
}
