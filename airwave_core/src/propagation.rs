//! Propagation Engine
//! ==================
//!
//! Computes the physical effect of one transmission on one candidate
//! receiver: distance, path loss, received power and propagation delay.
//!
//! Loss and delay are pluggable. A model is a pure function of the two
//! positions and the carrier frequency; the channel swaps models at runtime
//! when it receives a configuration update.
//!
//! Units:
//! - Power: dBm (conversion to watts provided)
//! - Distance: meters
//! - Frequency: Hz

use crate::error::ModelError;
use crate::message::{ConfigKind, ConfigurationUpdate, MessageKind};
use crate::types::Position;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::Debug;
use std::time::Duration;

/// Speed of light in vacuum (m/s).
pub const SPEED_OF_LIGHT_MPS: f64 = 299_792_458.0;

// =============================================================================
// PURE HELPERS
// =============================================================================

/// Euclidean distance between two positions in meters.
pub fn distance(a: &Position, b: &Position) -> f64 {
    (b - a).norm()
}

/// Free-space path loss in dB.
///
/// ```text
/// FSPL(d, f) = 20 × log₁₀(4π × d × f / c)
/// ```
///
/// Returns 0 for a zero distance. In the near field, where the formula
/// would go negative, the loss is clamped to 0 so that it stays
/// non-decreasing in distance.
pub fn free_space_path_loss_db(distance_m: f64, frequency_hz: f64) -> f64 {
    if distance_m <= 0.0 || frequency_hz <= 0.0 {
        return 0.0;
    }
    let loss = 20.0 * (4.0 * PI * distance_m * frequency_hz / SPEED_OF_LIGHT_MPS).log10();
    loss.max(0.0)
}

/// Link budget: `tx - loss + txGain + rxGain`.
pub fn received_power_dbm(
    tx_power_dbm: f64,
    path_loss_db: f64,
    tx_antenna_gain_db: f64,
    rx_antenna_gain_db: f64,
) -> f64 {
    tx_power_dbm - path_loss_db + tx_antenna_gain_db + rx_antenna_gain_db
}

/// Time for a signal to cover `distance_m` at the speed of light.
pub fn propagation_delay(distance_m: f64) -> Duration {
    secs_to_duration(distance_m / SPEED_OF_LIGHT_MPS)
}

pub fn dbm_to_watts(dbm: f64) -> f64 {
    10f64.powf((dbm - 30.0) / 10.0)
}

/// Inverse of [`dbm_to_watts`]. Non-positive power maps to -∞ dBm.
pub fn watts_to_dbm(watts: f64) -> f64 {
    if watts <= 0.0 {
        return f64::NEG_INFINITY;
    }
    10.0 * watts.log10() + 30.0
}

/// Truncates to whole nanoseconds. The cast saturates, so NaN and negative
/// values become zero and huge values become `u64::MAX` nanoseconds.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::from_nanos((secs * 1e9) as u64)
}

// =============================================================================
// MODEL TRAITS
// =============================================================================

/// Attenuation between two positions.
pub trait LossModel: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn path_loss_db(&self, tx: &Position, rx: &Position, frequency_hz: f64) -> f64;
}

/// Time of flight between two positions.
pub trait DelayModel: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn delay(&self, tx: &Position, rx: &Position) -> Duration;
}

/// Friis free-space loss. The default model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FreeSpaceLoss;

impl LossModel for FreeSpaceLoss {
    fn name(&self) -> &'static str {
        "free-space"
    }

    fn path_loss_db(&self, tx: &Position, rx: &Position, frequency_hz: f64) -> f64 {
        free_space_path_loss_db(distance(tx, rx), frequency_hz)
    }
}

/// Log-distance loss without shadowing.
///
/// ```text
/// PL(d) = PL(d₀) + 10 × n × log₁₀(d / d₀)
/// ```
///
/// Distances below `d₀` return `PL(d₀)`. Frequency is folded into the
/// reference loss and otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogDistanceLoss {
    /// Path loss exponent (2.0 free space, ~3 urban)
    pub exponent: f64,
    pub reference_distance_m: f64,
    pub reference_loss_db: f64,
}

impl Default for LogDistanceLoss {
    fn default() -> Self {
        Self {
            exponent: 3.0,
            reference_distance_m: 1.0,
            // Free-space loss at 1 m, 2.4 GHz
            reference_loss_db: 40.05,
        }
    }
}

impl LossModel for LogDistanceLoss {
    fn name(&self) -> &'static str {
        "log-distance"
    }

    fn path_loss_db(&self, tx: &Position, rx: &Position, _frequency_hz: f64) -> f64 {
        let d = distance(tx, rx);
        if d <= self.reference_distance_m {
            return self.reference_loss_db;
        }
        self.reference_loss_db + 10.0 * self.exponent * (d / self.reference_distance_m).log10()
    }
}

/// Unit-disc model: no loss within `max_range_m`, nothing heard beyond it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeLoss {
    pub max_range_m: f64,
}

impl Default for RangeLoss {
    fn default() -> Self {
        Self { max_range_m: 1000.0 }
    }
}

impl LossModel for RangeLoss {
    fn name(&self) -> &'static str {
        "range"
    }

    fn path_loss_db(&self, tx: &Position, rx: &Position, _frequency_hz: f64) -> f64 {
        if distance(tx, rx) <= self.max_range_m {
            0.0
        } else {
            f64::INFINITY
        }
    }
}

/// Delay proportional to distance. Defaults to the speed of light.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantSpeedDelay {
    pub speed_mps: f64,
}

impl Default for ConstantSpeedDelay {
    fn default() -> Self {
        Self {
            speed_mps: SPEED_OF_LIGHT_MPS,
        }
    }
}

impl DelayModel for ConstantSpeedDelay {
    fn name(&self) -> &'static str {
        "constant-speed"
    }

    fn delay(&self, tx: &Position, rx: &Position) -> Duration {
        if self.speed_mps <= 0.0 {
            return Duration::from_nanos(u64::MAX);
        }
        secs_to_duration(distance(tx, rx) / self.speed_mps)
    }
}

/// Same delay for every pair regardless of distance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedDelay {
    pub delay_nanos: u64,
}

impl DelayModel for FixedDelay {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn delay(&self, _tx: &Position, _rx: &Position) -> Duration {
        Duration::from_nanos(self.delay_nanos)
    }
}

// =============================================================================
// MODEL SELECTION (wire form of CONFIG_* payloads)
// =============================================================================

/// Loss model selection as carried in `CONFIG_LOSS_MODEL`.
///
/// `modelKind` picks the variant; the parameter blob is the model's fields
/// as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LossModelSpec {
    FreeSpace,
    LogDistance(LogDistanceLoss),
    Range(RangeLoss),
}

impl LossModelSpec {
    pub const FREE_SPACE: u32 = 1;
    pub const LOG_DISTANCE: u32 = 2;
    pub const RANGE: u32 = 3;

    pub fn model_kind(&self) -> u32 {
        match self {
            LossModelSpec::FreeSpace => Self::FREE_SPACE,
            LossModelSpec::LogDistance(_) => Self::LOG_DISTANCE,
            LossModelSpec::Range(_) => Self::RANGE,
        }
    }

    pub fn encode_params(&self) -> Result<Bytes, ModelError> {
        let raw = match self {
            LossModelSpec::FreeSpace => Vec::new(),
            LossModelSpec::LogDistance(m) => serde_json::to_vec(m)?,
            LossModelSpec::Range(m) => serde_json::to_vec(m)?,
        };
        Ok(Bytes::from(raw))
    }

    /// Parses a `(modelKind, params)` pair. An empty blob means defaults.
    pub fn decode(model_kind: u32, params: &[u8]) -> Result<Self, ModelError> {
        match model_kind {
            Self::FREE_SPACE => Ok(LossModelSpec::FreeSpace),
            Self::LOG_DISTANCE => Ok(LossModelSpec::LogDistance(parse_params(params)?)),
            Self::RANGE => Ok(LossModelSpec::Range(parse_params(params)?)),
            other => Err(ModelError::UnknownModel {
                config: ConfigKind::LossModel.name(),
                model_kind: other,
            }),
        }
    }

    pub fn build(&self) -> Box<dyn LossModel> {
        match self {
            LossModelSpec::FreeSpace => Box::new(FreeSpaceLoss),
            LossModelSpec::LogDistance(m) => Box::new(*m),
            LossModelSpec::Range(m) => Box::new(*m),
        }
    }

    pub fn to_update(&self) -> Result<ConfigurationUpdate, ModelError> {
        Ok(ConfigurationUpdate {
            config_kind: ConfigKind::LossModel,
            model_kind: self.model_kind(),
            params: self.encode_params()?,
        })
    }
}

/// Delay model selection as carried in `CONFIG_DELAY_MODEL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DelayModelSpec {
    ConstantSpeed(ConstantSpeedDelay),
    Fixed(FixedDelay),
}

impl DelayModelSpec {
    pub const CONSTANT_SPEED: u32 = 1;
    pub const FIXED: u32 = 2;

    pub fn model_kind(&self) -> u32 {
        match self {
            DelayModelSpec::ConstantSpeed(_) => Self::CONSTANT_SPEED,
            DelayModelSpec::Fixed(_) => Self::FIXED,
        }
    }

    pub fn encode_params(&self) -> Result<Bytes, ModelError> {
        let raw = match self {
            DelayModelSpec::ConstantSpeed(m) => serde_json::to_vec(m)?,
            DelayModelSpec::Fixed(m) => serde_json::to_vec(m)?,
        };
        Ok(Bytes::from(raw))
    }

    pub fn decode(model_kind: u32, params: &[u8]) -> Result<Self, ModelError> {
        match model_kind {
            Self::CONSTANT_SPEED => Ok(DelayModelSpec::ConstantSpeed(parse_params(params)?)),
            Self::FIXED => Ok(DelayModelSpec::Fixed(parse_params(params)?)),
            other => Err(ModelError::UnknownModel {
                config: ConfigKind::DelayModel.name(),
                model_kind: other,
            }),
        }
    }

    pub fn build(&self) -> Box<dyn DelayModel> {
        match self {
            DelayModelSpec::ConstantSpeed(m) => Box::new(*m),
            DelayModelSpec::Fixed(m) => Box::new(*m),
        }
    }

    pub fn to_update(&self) -> Result<ConfigurationUpdate, ModelError> {
        Ok(ConfigurationUpdate {
            config_kind: ConfigKind::DelayModel,
            model_kind: self.model_kind(),
            params: self.encode_params()?,
        })
    }
}

fn parse_params<T>(params: &[u8]) -> Result<T, ModelError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if params.is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(params)?)
}

// =============================================================================
// ENGINE
// =============================================================================

/// Result of evaluating one transmitter/receiver pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkBudget {
    pub distance_m: f64,
    pub path_loss_db: f64,
    pub rx_power_dbm: f64,
    pub delay: Duration,
}

impl LinkBudget {
    pub fn delay_nanos(&self) -> u64 {
        u64::try_from(self.delay.as_nanos()).unwrap_or(u64::MAX)
    }
}

/// One side of a link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Antenna {
    pub position: Position,
    pub gain_db: f64,
}

/// The active loss and delay models.
#[derive(Debug)]
pub struct PropagationEngine {
    loss: Box<dyn LossModel>,
    delay: Box<dyn DelayModel>,
}

impl Default for PropagationEngine {
    fn default() -> Self {
        Self::new(Box::new(FreeSpaceLoss), Box::new(ConstantSpeedDelay::default()))
    }
}

impl PropagationEngine {
    pub fn new(loss: Box<dyn LossModel>, delay: Box<dyn DelayModel>) -> Self {
        Self { loss, delay }
    }

    pub fn loss_model(&self) -> &dyn LossModel {
        self.loss.as_ref()
    }

    pub fn delay_model(&self) -> &dyn DelayModel {
        self.delay.as_ref()
    }

    pub fn set_loss_model(&mut self, model: Box<dyn LossModel>) {
        self.loss = model;
    }

    pub fn set_delay_model(&mut self, model: Box<dyn DelayModel>) {
        self.delay = model;
    }

    /// Installs the model described by a `CONFIG_*` payload.
    ///
    /// `message_kind` is the header kind; it must agree with the payload's
    /// `configKind`. Returns the name of the newly active model.
    pub fn apply_update(
        &mut self,
        message_kind: MessageKind,
        update: &ConfigurationUpdate,
    ) -> Result<&'static str, ModelError> {
        match (message_kind, update.config_kind) {
            (MessageKind::ConfigLossModel, ConfigKind::LossModel) => {
                let spec = LossModelSpec::decode(update.model_kind, &update.params)?;
                self.loss = spec.build();
                Ok(self.loss.name())
            }
            (MessageKind::ConfigDelayModel, ConfigKind::DelayModel) => {
                let spec = DelayModelSpec::decode(update.model_kind, &update.params)?;
                self.delay = spec.build();
                Ok(self.delay.name())
            }
            (kind, config) => Err(ModelError::ConfigKindMismatch {
                config_kind: config.name(),
                message_kind: kind.name(),
            }),
        }
    }

    /// Evaluates the link from `tx` to `rx` for a transmission at
    /// `tx_power_dbm` on `frequency_hz`.
    pub fn link_budget(
        &self,
        tx: &Antenna,
        rx: &Antenna,
        tx_power_dbm: f64,
        frequency_hz: f64,
    ) -> LinkBudget {
        let path_loss_db = self.loss.path_loss_db(&tx.position, &rx.position, frequency_hz);
        LinkBudget {
            distance_m: distance(&tx.position, &rx.position),
            path_loss_db,
            rx_power_dbm: received_power_dbm(tx_power_dbm, path_loss_db, tx.gain_db, rx.gain_db),
            delay: self.delay.delay(&tx.position, &rx.position),
        }
    }
}
