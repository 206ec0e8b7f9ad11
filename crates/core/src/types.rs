use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TdmaError};

pub type SlotId = u32;
pub type FragmentId = u32;

/// Width of the node identifier field on the wire.
pub const NODE_ID_LEN: usize = 32;

/// ASCII node identifier, at most [`NODE_ID_LEN`] bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.len() > NODE_ID_LEN {
            return Err(TdmaError::InvalidNodeId(format!(
                "{} bytes exceeds the {}-byte field",
                id.len(),
                NODE_ID_LEN
            )));
        }
        if !id.is_ascii() || id.bytes().any(|b| b == 0) {
            return Err(TdmaError::InvalidNodeId(format!("{:?} is not printable ascii", id)));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Zero-padded wire form.
    pub fn to_wire(&self) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }

    /// Reads the wire form, trimming trailing zero bytes. Non-ASCII bytes or
    /// a zero byte before the padding are `InvalidNodeId`.
    pub fn from_wire(raw: &[u8; NODE_ID_LEN]) -> Result<Self> {
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let id = &raw[..end];
        if !id.is_ascii() || id.contains(&0) {
            return Err(TdmaError::InvalidNodeId(format!("wire bytes {:02x?}", id)));
        }
        let id = std::str::from_utf8(id).map_err(|e| TdmaError::InvalidNodeId(e.to_string()))?;
        Self::new(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = TdmaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = TdmaError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}
