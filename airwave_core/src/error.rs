//! Error types for the Airwave channel protocol.

use crate::types::EndpointId;
use airwave_env::{EnvError, Rank};
use thiserror::Error;

/// Malformed or rejected wire data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Fewer bytes are present than the header or a field requires.
    #[error("Truncated message: needed {needed} bytes, {available} available")]
    TruncatedMessage { needed: usize, available: usize },

    /// `kind` is outside the defined enumeration.
    #[error("Unknown message kind: {0}")]
    UnknownKind(u32),

    /// `totalSize` disagrees with the actual byte count.
    #[error("Size mismatch: header declares {declared} bytes, got {actual}")]
    SizeMismatch { declared: u32, actual: usize },

    /// The encoded message would not fit the 32-bit size fields.
    #[error("Message too large to encode: {size} bytes")]
    Oversized { size: usize },

    /// Header claims a different sender than the transport reported.
    #[error("Source rank mismatch: header says {claimed}, transport says {actual}")]
    SourceRankMismatch { claimed: Rank, actual: Rank },

    /// `totalSize` below the header size or above the configured maximum.
    #[error("Message size {size} outside [{min}, {max}]")]
    SizeOutOfBounds { size: u32, min: u32, max: u32 },

    /// Sender's timestamp is ahead of local simulation time beyond tolerance.
    #[error("Timestamp {timestamp_nanos}ns is ahead of local time {now_nanos}ns (tolerance {tolerance_nanos}ns)")]
    TimestampInFuture {
        timestamp_nanos: u64,
        now_nanos: u64,
        tolerance_nanos: u64,
    },

    /// A field holds a value the protocol does not define.
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Failures building a propagation model from a configuration update.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Unknown {config} model kind: {model_kind}")]
    UnknownModel { config: &'static str, model_kind: u32 },

    #[error("Invalid model parameters: {0}")]
    InvalidParameters(#[from] serde_json::Error),

    #[error("Config kind {config_kind} does not match message kind {message_kind}")]
    ConfigKindMismatch {
        config_kind: &'static str,
        message_kind: &'static str,
    },
}

/// Errors raised inside the channel-side processor.
///
/// Only `initialize` returns these to a caller; message handlers log them.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Channel processor must run on {expected}, current rank is {actual}")]
    WrongRank { expected: Rank, actual: Rank },

    #[error("Processor has not been initialized")]
    NotInitialized,

    #[error("Transmission from unregistered sender {endpoint} on {rank}")]
    UnregisteredSender { rank: Rank, endpoint: EndpointId },

    #[error("Request for unregistered device {endpoint} on {rank}")]
    UnregisteredTarget { rank: Rank, endpoint: EndpointId },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Transport(#[from] EnvError),
}

/// Failures loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
