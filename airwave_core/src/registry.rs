//! Device Registry
//! ===============
//!
//! Channel-local table of every endpoint the channel knows about.
//!
//! Primary key is the authoritative [`DeviceId`]. Two secondary indices
//! are kept in step with it:
//! - owner rank → device ids, for bulk operations when a rank goes away
//! - (owner rank, endpoint id) → device id, to resolve ids carried on the wire
//!
//! The registry is owned and mutated by the channel processor only, on the
//! channel's single event thread, so it holds no locks.

use crate::types::{DeviceId, EndpointId, Position};
use airwave_env::Rank;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// One wireless endpoint known to the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub owner_rank: Rank,
    /// The owner's own id for this endpoint, if it registered with one
    pub endpoint_id: Option<EndpointId>,
    pub position: Position,
    pub antenna_gain_db: f64,
    pub frequency_hz: u32,
    pub last_activity_nanos: u64,
    pub is_active: bool,
}

/// Registration data for [`DeviceRegistry::register_endpoint`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewDevice {
    pub owner_rank: Rank,
    pub endpoint_id: EndpointId,
    pub position: Position,
    pub antenna_gain_db: f64,
    pub frequency_hz: u32,
    pub now_nanos: u64,
}

/// Outcome of [`DeviceRegistry::register_endpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub device_id: DeviceId,
    /// False when an existing record for the same endpoint was refreshed
    pub created: bool,
}

#[derive(Debug)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceRecord>,
    by_rank: HashMap<Rank, BTreeSet<DeviceId>>,
    by_endpoint: HashMap<(Rank, EndpointId), DeviceId>,
    next_id: u32,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            by_rank: HashMap::new(),
            by_endpoint: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocates the next id. Ids are never handed out twice; the counter
    /// saturates at `u32::MAX`.
    fn allocate(&mut self) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    fn insert(&mut self, record: DeviceRecord) {
        self.by_rank
            .entry(record.owner_rank)
            .or_default()
            .insert(record.device_id);
        if let Some(endpoint) = record.endpoint_id {
            self.by_endpoint
                .insert((record.owner_rank, endpoint), record.device_id);
        }
        self.devices.insert(record.device_id, record);
    }

    /// Registers an anonymous device at `position` with default radio
    /// parameters and returns its fresh id.
    pub fn register(&mut self, owner_rank: Rank, position: Position) -> DeviceId {
        let device_id = self.allocate();
        self.insert(DeviceRecord {
            device_id,
            owner_rank,
            endpoint_id: None,
            position,
            antenna_gain_db: 0.0,
            frequency_hz: 0,
            last_activity_nanos: 0,
            is_active: true,
        });
        debug!(%device_id, rank = %owner_rank, "Registered device");
        device_id
    }

    /// Registers an endpoint announced by its owner rank.
    ///
    /// Registering the same `(owner_rank, endpoint_id)` again refreshes the
    /// existing record and keeps its id.
    pub fn register_endpoint(&mut self, device: NewDevice) -> Registration {
        let key = (device.owner_rank, device.endpoint_id);
        if let Some(&device_id) = self.by_endpoint.get(&key) {
            if let Some(record) = self.devices.get_mut(&device_id) {
                record.position = device.position;
                record.antenna_gain_db = device.antenna_gain_db;
                record.frequency_hz = device.frequency_hz;
                record.last_activity_nanos = device.now_nanos;
                record.is_active = true;
                debug!(%device_id, rank = %device.owner_rank, endpoint = %device.endpoint_id, "Refreshed registration");
                return Registration {
                    device_id,
                    created: false,
                };
            }
        }

        let device_id = self.allocate();
        self.insert(DeviceRecord {
            device_id,
            owner_rank: device.owner_rank,
            endpoint_id: Some(device.endpoint_id),
            position: device.position,
            antenna_gain_db: device.antenna_gain_db,
            frequency_hz: device.frequency_hz,
            last_activity_nanos: device.now_nanos,
            is_active: true,
        });
        debug!(%device_id, rank = %device.owner_rank, endpoint = %device.endpoint_id, "Registered endpoint");
        Registration {
            device_id,
            created: true,
        }
    }

    /// Removes a device from every index. Unknown ids are a logged no-op.
    pub fn unregister(&mut self, device_id: DeviceId) -> Option<DeviceRecord> {
        let Some(record) = self.devices.remove(&device_id) else {
            warn!(%device_id, "Unregister for unknown device");
            return None;
        };

        if let Some(ids) = self.by_rank.get_mut(&record.owner_rank) {
            ids.remove(&device_id);
            if ids.is_empty() {
                self.by_rank.remove(&record.owner_rank);
            }
        }
        if let Some(endpoint) = record.endpoint_id {
            self.by_endpoint.remove(&(record.owner_rank, endpoint));
        }
        debug!(%device_id, rank = %record.owner_rank, "Unregistered device");
        Some(record)
    }

    /// Removes every device owned by `rank`, returning their ids.
    pub fn unregister_rank(&mut self, rank: Rank) -> Vec<DeviceId> {
        let ids = self.devices_on_rank(rank);
        for id in &ids {
            self.unregister(*id);
        }
        ids
    }

    /// Moves a device and refreshes its activity time.
    ///
    /// Returns false (with a warning) if the device is unknown.
    pub fn update_position(&mut self, device_id: DeviceId, position: Position, now_nanos: u64) -> bool {
        match self.devices.get_mut(&device_id) {
            Some(record) => {
                record.position = position;
                record.last_activity_nanos = now_nanos;
                true
            }
            None => {
                warn!(%device_id, "Position update for unknown device");
                false
            }
        }
    }

    pub fn touch(&mut self, device_id: DeviceId, now_nanos: u64) -> bool {
        match self.devices.get_mut(&device_id) {
            Some(record) => {
                record.last_activity_nanos = now_nanos;
                true
            }
            None => false,
        }
    }

    /// Refreshes every device on `rank`. Returns how many were touched.
    pub fn touch_rank(&mut self, rank: Rank, now_nanos: u64) -> usize {
        let ids = self.devices_on_rank(rank);
        ids.iter().filter(|id| self.touch(**id, now_nanos)).count()
    }

    pub fn set_active(&mut self, device_id: DeviceId, active: bool) -> bool {
        match self.devices.get_mut(&device_id) {
            Some(record) => {
                record.is_active = active;
                true
            }
            None => {
                warn!(%device_id, "Activity change for unknown device");
                false
            }
        }
    }

    /// Unregisters devices idle for longer than `timeout_nanos`.
    pub fn expire_inactive(&mut self, now_nanos: u64, timeout_nanos: u64) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|r| now_nanos.saturating_sub(r.last_activity_nanos) > timeout_nanos)
            .map(|r| r.device_id)
            .collect();
        for id in &stale {
            self.unregister(*id);
        }
        stale
    }

    pub fn get(&self, device_id: DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(&device_id)
    }

    /// Looks up the global id of an endpoint announced by `owner_rank`.
    pub fn resolve(&self, owner_rank: Rank, endpoint_id: EndpointId) -> Option<DeviceId> {
        self.by_endpoint.get(&(owner_rank, endpoint_id)).copied()
    }

    /// Every other device, in ascending id order.
    pub fn all_except(&self, device_id: DeviceId) -> impl Iterator<Item = &DeviceRecord> + '_ {
        self.devices
            .values()
            .filter(move |record| record.device_id != device_id)
    }

    pub fn devices_on_rank(&self, rank: Rank) -> Vec<DeviceId> {
        self.by_rank
            .get(&rank)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> + '_ {
        self.devices.values()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
