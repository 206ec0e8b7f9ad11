//! Frame purpose.
//!
//! Controllers match on [`Control`]; the text payloads below exist only for
//! wire compatibility with peers that speak the string convention.

use tdma_core::SlotId;

const SLOT_QUERY: &str = "GET_CURRENT_SLOT";
const CURRENT_SLOT_PREFIX: &str = "CURRENT_SLOT_";
const SLOT_ACK_PREFIX: &str = "ACK_SLOT_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Station asks the hub for its current slot.
    SlotQuery,
    /// Hub's answer to [`Control::SlotQuery`].
    CurrentSlot(SlotId),
    /// Hub acknowledges a data frame and names the slot it allocated.
    SlotAck(SlotId),
    Data(Vec<u8>),
}

impl Control {
    pub fn from_payload(payload: &[u8]) -> Self {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => return Control::Data(payload.to_vec()),
        };
        if text == SLOT_QUERY {
            return Control::SlotQuery;
        }
        if let Some(slot) = parse_tagged(text, CURRENT_SLOT_PREFIX) {
            return Control::CurrentSlot(slot);
        }
        if let Some(slot) = parse_tagged(text, SLOT_ACK_PREFIX) {
            return Control::SlotAck(slot);
        }
        Control::Data(payload.to_vec())
    }

    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            Control::SlotQuery => SLOT_QUERY.as_bytes().to_vec(),
            Control::CurrentSlot(slot) => format!("{}{}", CURRENT_SLOT_PREFIX, slot).into_bytes(),
            Control::SlotAck(slot) => format!("{}{}", SLOT_ACK_PREFIX, slot).into_bytes(),
            Control::Data(data) => data.clone(),
        }
    }
}

fn parse_tagged(text: &str, prefix: &str) -> Option<SlotId> {
    let digits = text.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
