//! Link-wide configuration.
//!
//! Resolution order: defaults, then an optional TOML file, then environment
//! overrides (`TDMA_TOTAL_SLOTS`, `TDMA_SLOT_DURATION_MS`,
//! `TDMA_EPOCH_UNIX_SECS`). Every component receives the resolved value in its
//! constructor.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TdmaError};

/// 2024-01-01T00:00:00Z
pub const DEFAULT_EPOCH_UNIX_SECS: u64 = 1_704_067_200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TdmaConfig {
    /// Shared reference instant every node derives slot indices from.
    pub epoch_unix_secs: u64,
    pub total_slots: u32,
    pub slot_duration_ms: u64,
    /// Incomplete reassemblies older than this are discarded.
    pub fragment_timeout_ms: u64,
    /// Largest payload slice the sender puts into one frame.
    pub max_fragment_payload: usize,
    /// Largest declared `length` a receiver will buffer.
    pub max_frame_payload: u32,
}

impl Default for TdmaConfig {
    fn default() -> Self {
        Self {
            epoch_unix_secs: DEFAULT_EPOCH_UNIX_SECS,
            total_slots: 10,
            slot_duration_ms: 1000,
            fragment_timeout_ms: 10_000,
            max_fragment_payload: 1024,
            max_frame_payload: 64 * 1024,
        }
    }
}

impl TdmaConfig {
    /// Loads `path` when given, applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| TdmaError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_override("TDMA_TOTAL_SLOTS")? {
            self.total_slots = v;
        }
        if let Some(v) = env_override("TDMA_SLOT_DURATION_MS")? {
            self.slot_duration_ms = v;
        }
        if let Some(v) = env_override("TDMA_EPOCH_UNIX_SECS")? {
            self.epoch_unix_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_slots == 0 {
            return Err(TdmaError::InvalidConfiguration("total_slots must be > 0".into()));
        }
        if self.slot_duration_ms == 0 {
            return Err(TdmaError::InvalidConfiguration("slot_duration_ms must be > 0".into()));
        }
        if self.max_fragment_payload == 0 {
            return Err(TdmaError::InvalidConfiguration(
                "max_fragment_payload must be > 0".into(),
            ));
        }
        if self.max_fragment_payload > self.max_frame_payload as usize {
            return Err(TdmaError::InvalidConfiguration(format!(
                "max_fragment_payload {} exceeds max_frame_payload {}",
                self.max_fragment_payload, self.max_frame_payload
            )));
        }
        Ok(())
    }

    pub fn epoch(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.epoch_unix_secs)
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::from_millis(self.slot_duration_ms)
    }

    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_millis(self.fragment_timeout_ms)
    }
}

fn env_override<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TdmaError::InvalidConfiguration(format!("{} is not a valid number: {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}
