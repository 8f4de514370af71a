//! Channel scenarios for deterministic simulation.

use crate::error::SimError;
use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// AW-001: Two devices 100 m apart take turns transmitting
    TwoDevices,

    /// AW-002: Two devices 100 km apart never hear each other
    OutOfRange,

    /// AW-003: Many endpoints on many ranks, random transmitters
    Crowd,

    /// AW-004: Endpoints come and go while others transmit
    Churn,

    /// AW-005: Loss and delay models replaced mid-run
    ModelSwap,

    /// AW-006: One device rank cut off from the channel, then healed
    Partition,

    /// AW-007: Endpoints random-walk between transmissions
    Mobility,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::TwoDevices,
            ScenarioId::OutOfRange,
            ScenarioId::Crowd,
            ScenarioId::Churn,
            ScenarioId::ModelSwap,
            ScenarioId::Partition,
            ScenarioId::Mobility,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::TwoDevices => "two_devices",
            ScenarioId::OutOfRange => "out_of_range",
            ScenarioId::Crowd => "crowd",
            ScenarioId::Churn => "churn",
            ScenarioId::ModelSwap => "model_swap",
            ScenarioId::Partition => "partition",
            ScenarioId::Mobility => "mobility",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::TwoDevices => "2 devices at 100 m, free space, one reception per transmission",
            ScenarioId::OutOfRange => "2 devices at 100 km, every receiver below threshold",
            ScenarioId::Crowd => "N ranks x M endpoints, random transmitters checked against the oracle",
            ScenarioId::Churn => "endpoints added and removed between transmissions, ids never reused",
            ScenarioId::ModelSwap => "range loss, log-distance loss and fixed delay installed mid-run",
            ScenarioId::Partition => "one rank partitioned from the channel, others unaffected, then healed",
            ScenarioId::Mobility => "random-walk position updates between transmissions",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "two_devices" | "twodevices" | "aw-001" => Ok(ScenarioId::TwoDevices),
            "out_of_range" | "outofrange" | "aw-002" => Ok(ScenarioId::OutOfRange),
            "crowd" | "aw-003" => Ok(ScenarioId::Crowd),
            "churn" | "aw-004" => Ok(ScenarioId::Churn),
            "model_swap" | "modelswap" | "aw-005" => Ok(ScenarioId::ModelSwap),
            "partition" | "aw-006" => Ok(ScenarioId::Partition),
            "mobility" | "aw-007" => Ok(ScenarioId::Mobility),
            _ => Err(SimError::UnknownScenario(s.to_string())),
        }
    }
}
