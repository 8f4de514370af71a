//! The channel capability seen by a device rank.
//!
//! A wireless endpoint never talks to the propagation model directly; it
//! goes through a [`ChannelTransport`]. Two implementations exist:
//! - `RemoteChannelStub` turns every call into a message to the channel rank
//! - `LocalChannel` computes receptions in-process
//!
//! Receptions come back through a [`ReceptionSink`] in both cases.

use crate::message::ReceptionNotification;
use crate::propagation::{DelayModelSpec, LossModelSpec};
use crate::types::{DeviceId, EndpointId, Position};
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;

/// Radio parameters of an endpoint that the channel needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelParameters {
    pub antenna_gain_db: f64,
}

impl Default for ChannelParameters {
    fn default() -> Self {
        Self {
            antenna_gain_db: 0.0,
        }
    }
}

/// Read accessors of a local wireless endpoint.
pub trait WirelessEndpoint {
    fn position(&self) -> Position;

    fn frequency_hz(&self) -> u32;

    fn channel_parameters(&self) -> ChannelParameters;
}

/// A plain endpoint with fixed properties.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticEndpoint {
    pub position: Position,
    pub frequency_hz: u32,
    pub parameters: ChannelParameters,
}

impl StaticEndpoint {
    pub fn new(position: Position, frequency_hz: u32) -> Self {
        Self {
            position,
            frequency_hz,
            parameters: ChannelParameters::default(),
        }
    }

    pub fn with_gain(mut self, antenna_gain_db: f64) -> Self {
        self.parameters.antenna_gain_db = antenna_gain_db;
        self
    }
}

impl WirelessEndpoint for StaticEndpoint {
    fn position(&self) -> Position {
        self.position
    }

    fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }

    fn channel_parameters(&self) -> ChannelParameters {
        self.parameters
    }
}

/// Snapshot of an endpoint taken when it was added to a channel.
///
/// The `endpoint_id` is assigned by the channel transport and identifies the
/// endpoint in every later call.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDescriptor {
    pub endpoint_id: EndpointId,
    pub position: Position,
    pub frequency_hz: u32,
    pub parameters: ChannelParameters,
}

impl EndpointDescriptor {
    pub fn from_endpoint(endpoint_id: EndpointId, endpoint: &dyn WirelessEndpoint) -> Self {
        Self {
            endpoint_id,
            position: endpoint.position(),
            frequency_hz: endpoint.frequency_hz(),
            parameters: endpoint.channel_parameters(),
        }
    }
}

/// A physical-layer frame handed to `transmit`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub bytes: Bytes,
    /// Airtime, if the PHY knows it
    pub duration: Option<Duration>,
}

impl Frame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Size as carried in `frameSizeBytes`.
    pub fn size_bytes(&self) -> u32 {
        u32::try_from(self.bytes.len()).unwrap_or(u32::MAX)
    }
}

/// A reception delivered to a local endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Reception {
    /// Local endpoint that heard the transmission
    pub endpoint_id: EndpointId,
    pub notification: ReceptionNotification,
}

impl Reception {
    pub fn receiver(&self) -> DeviceId {
        DeviceId(self.notification.receiver_device_id)
    }

    pub fn transmitter(&self) -> DeviceId {
        DeviceId(self.notification.transmitter_device_id)
    }
}

/// Consumer of receptions, typically the PHY above the channel.
pub trait ReceptionSink: Send + Sync {
    fn on_reception(&self, reception: Reception);
}

impl<F> ReceptionSink for F
where
    F: Fn(Reception) + Send + Sync,
{
    fn on_reception(&self, reception: Reception) {
        self(reception)
    }
}

/// A sink that keeps every reception for later inspection.
#[derive(Debug, Default)]
pub struct CollectingSink {
    received: Mutex<Vec<Reception>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receptions(&self) -> Vec<Reception> {
        self.received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.received.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything collected so far.
    pub fn drain(&self) -> Vec<Reception> {
        match self.received.lock() {
            Ok(mut r) => std::mem::take(&mut *r),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl ReceptionSink for CollectingSink {
    fn on_reception(&self, reception: Reception) {
        match self.received.lock() {
            Ok(mut r) => r.push(reception),
            Err(poisoned) => poisoned.into_inner().push(reception),
        }
    }
}

/// Channel operations available to a device rank.
///
/// Every operation is fire-and-forget: it returns once the request has been
/// handed on and reports failures through logs and counters only.
pub trait ChannelTransport {
    /// Adds `endpoint` to the channel and returns its descriptor.
    fn add_endpoint(&mut self, endpoint: &dyn WirelessEndpoint) -> EndpointDescriptor;

    /// Transmits `frame` from `endpoint` at `tx_power_dbm`.
    fn transmit(&mut self, endpoint: &EndpointDescriptor, frame: &Frame, tx_power_dbm: f64);

    fn set_loss_model(&mut self, model: &LossModelSpec);

    fn set_delay_model(&mut self, model: &DelayModelSpec);

    fn remove_endpoint(&mut self, endpoint: &EndpointDescriptor);

    /// Moves `endpoint`, updating the descriptor in place.
    fn update_position(&mut self, endpoint: &mut EndpointDescriptor, position: Position);
}
