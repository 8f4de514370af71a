//! Configuration for the channel processor and device-side stubs.
//!
//! Every struct has a `Default` and accepts partial JSON, so a config file
//! only needs the fields it changes:
//!
//! ```json
//! { "processor": { "reception_threshold_dbm": -90.0 }, "stub": { "payload_mode": "size_only" } }
//! ```

use crate::error::ConfigError;
use crate::validation::{ValidationLimits, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_TIMESTAMP_TOLERANCE_NANOS};
use airwave_env::Rank;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default reception threshold in dBm.
pub const DEFAULT_RECEPTION_THRESHOLD_DBM: f64 = -85.0;

/// Configuration for the channel-side processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Rank the processor must run on (default: 0)
    pub channel_rank: Rank,

    /// Receivers below this power hear nothing (default: -85 dBm)
    pub reception_threshold_dbm: f64,

    /// How far a sender's timestamp may run ahead of local time (default: 1 s)
    pub timestamp_tolerance_nanos: u64,

    /// Largest accepted message (default: 1 MB)
    pub max_message_size: u32,

    /// Copy transmitted frames into reception notifications
    pub echo_payload: bool,

    /// Answer rejected transmissions with ERROR_RESPONSE
    pub error_responses: bool,

    /// Drop devices silent for this long; `None` keeps them forever
    pub inactivity_timeout_nanos: Option<u64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            channel_rank: Rank::CHANNEL,
            reception_threshold_dbm: DEFAULT_RECEPTION_THRESHOLD_DBM,
            timestamp_tolerance_nanos: DEFAULT_TIMESTAMP_TOLERANCE_NANOS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            echo_payload: false,
            error_responses: false,
            inactivity_timeout_nanos: None,
        }
    }
}

impl ProcessorConfig {
    pub fn limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_message_size: self.max_message_size,
            timestamp_tolerance_nanos: self.timestamp_tolerance_nanos,
        }
    }
}

/// How much of a frame a stub puts on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    /// Frame bytes travel with the request
    #[default]
    Full,
    /// Only the request travels; the payload section is empty
    SizeOnly,
}

/// Configuration for a device-side stub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StubConfig {
    pub channel_rank: Rank,

    pub payload_mode: PayloadMode,

    /// Suggested heartbeat period for hosts that drive `heartbeat()`
    pub heartbeat_interval_nanos: Option<u64>,

    /// Checks applied to inbound headers from the channel
    pub limits: ValidationLimits,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            channel_rank: Rank::CHANNEL,
            payload_mode: PayloadMode::Full,
            heartbeat_interval_nanos: None,
            limits: ValidationLimits::default(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AirwaveConfig {
    pub processor: ProcessorConfig,
    pub stub: StubConfig,
}

impl AirwaveConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
