//! Error types for the Airwave environment abstraction.

use crate::types::Rank;
use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The transport could not accept the message (closed, not initialized).
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Target rank is unknown to the transport or cut off by a partition.
    #[error("Rank unreachable: {0}")]
    RankUnreachable(Rank),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),
}

impl EnvError {
    /// Creates a transport-unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::TransportUnavailable(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(rank: Rank) -> Self {
        Self::RankUnreachable(rank)
    }
}
