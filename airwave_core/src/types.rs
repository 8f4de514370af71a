//! Identifiers and geometric types shared across the protocol.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A 3D position in meters.
pub type Position = Vector3<f64>;

/// Authoritative device identifier assigned by the channel registry.
///
/// Ids start at 1, increase monotonically and are never reused in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Identifier a device rank gives to one of its own endpoints.
///
/// Only unique within the owning rank; the channel pairs it with the owner
/// rank to find the matching [`DeviceId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub u32);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}
