//! Common types for the Airwave environment abstraction.

use serde::{Deserialize, Serialize};

/// Identifier of a participating process in the distributed simulation.
///
/// Ranks are dense small integers handed out by the launcher (MPI-style).
/// By convention rank 0 hosts the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rank(pub u32);

impl Rank {
    /// The conventional channel rank.
    pub const CHANNEL: Rank = Rank(0);

    /// Creates a rank from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw wire value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// True if this is the conventional channel rank.
    pub fn is_channel(&self) -> bool {
        *self == Self::CHANNEL
    }
}

impl From<u32> for Rank {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rank{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_rank_convention() {
        assert!(Rank::CHANNEL.is_channel());
        assert!(!Rank::new(3).is_channel());
        assert_eq!(Rank::from(7).as_u32(), 7);
        assert_eq!(Rank::new(2).to_string(), "rank2");
    }
}
