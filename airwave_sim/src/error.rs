//! Errors raised while setting up or running a simulation.

use airwave_core::{ConfigError, ProcessorError};
use airwave_env::Rank;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Channel rank {rank} is outside a world of {world_size} ranks")]
    ChannelRankOutOfRange { rank: Rank, world_size: u32 },

    #[error("Channel processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
}
