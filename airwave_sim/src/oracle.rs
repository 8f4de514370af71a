//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated channel: every
//! endpoint the scenario placed, where it is, and which propagation models
//! are in force. It computes expected receptions with a [`LocalChannel`],
//! the single-process implementation of the same channel, so the
//! distributed path is checked against an independent run of the same
//! rules.
//!
//! Endpoints are keyed by `(rank, local endpoint id)`, which both sides
//! agree on without knowing the channel's global device ids.

use crate::context::{SimClock, SimContext};

use airwave_core::propagation::{dbm_to_watts, watts_to_dbm};
use airwave_core::{
    ChannelTransport, CollectingSink, DelayModelSpec, EndpointDescriptor, EndpointId,
    LocalChannel, LossModelSpec, Position, ProcessorConfig, StaticEndpoint,
};
use airwave_env::Rank;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// `(owner rank, local endpoint id)`
pub type DeviceKey = (Rank, EndpointId);

/// A reception the oracle says must happen.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedReception {
    pub transmitter: DeviceKey,
    pub receiver: DeviceKey,
    pub tx_time_ns: u64,
    pub rx_power_dbm: f64,
    pub arrival_ns: u64,
}

/// A reception a device rank actually got.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedReception {
    pub transmitter: DeviceKey,
    pub receiver: DeviceKey,
    pub tx_time_ns: u64,
    pub rx_power_dbm: f64,
    pub arrival_ns: u64,
    pub delivered_at_ns: u64,
}

/// Outcome of matching observed receptions against expected ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Comparison {
    pub matched: usize,
    /// Expected but never delivered
    pub missing: usize,
    /// Delivered but not expected
    pub unexpected: usize,
    /// Matched, but delivered at a different time than it arrives
    pub mistimed: usize,
    /// Largest received-power disagreement among matched receptions
    pub max_power_error_db: f64,
}

/// Received-power disagreement tolerated between the two paths.
pub const POWER_TOLERANCE_DB: f64 = 1e-6;

impl Comparison {
    pub fn is_exact(&self) -> bool {
        self.missing == 0
            && self.unexpected == 0
            && self.mistimed == 0
            && self.max_power_error_db <= POWER_TOLERANCE_DB
    }

    pub fn failure_reason(&self) -> Option<String> {
        if self.is_exact() {
            return None;
        }
        Some(format!(
            "{} matched, {} missing, {} unexpected, {} mistimed, max power error {:.3e} dB",
            self.matched, self.missing, self.unexpected, self.mistimed, self.max_power_error_db
        ))
    }
}

type MatchKey = (u64, DeviceKey, DeviceKey);

/// Matches receptions by `(tx time, transmitter, receiver)`.
pub fn compare(expected: &[ExpectedReception], observed: &[ObservedReception]) -> Comparison {
    let mut pending: BTreeMap<MatchKey, Vec<&ExpectedReception>> = BTreeMap::new();
    for e in expected {
        pending
            .entry((e.tx_time_ns, e.transmitter, e.receiver))
            .or_default()
            .push(e);
    }

    let mut result = Comparison::default();
    for o in observed {
        let key = (o.tx_time_ns, o.transmitter, o.receiver);
        let Some(e) = pending.get_mut(&key).and_then(|v| v.pop()) else {
            debug!(?o, "Unexpected reception");
            result.unexpected += 1;
            continue;
        };
        result.matched += 1;
        let error = (e.rx_power_dbm - o.rx_power_dbm).abs();
        if error > result.max_power_error_db {
            result.max_power_error_db = error;
        }
        if o.arrival_ns != e.arrival_ns || o.delivered_at_ns != e.arrival_ns {
            result.mistimed += 1;
        }
    }
    result.missing = pending.values().map(Vec::len).sum();
    result
}

/// The Oracle - mirrors every placement and computes expected receptions.
pub struct Oracle {
    channel: LocalChannel<SimContext>,

    /// Local-channel descriptor of each placed endpoint
    placed: HashMap<DeviceKey, EndpointDescriptor>,

    /// Local-channel endpoint id back to the scenario's key
    owners: HashMap<EndpointId, DeviceKey>,
}

impl Oracle {
    /// Creates an oracle applying the same thresholds as `config`.
    ///
    /// Runs on a private clock: the oracle only previews transmissions and
    /// never delivers anything.
    pub fn new(seed: u64, config: ProcessorConfig) -> Self {
        let ctx = SimContext::shared(SimClock::shared(), config.channel_rank, 1, seed);
        let channel = LocalChannel::new(ctx, config, Arc::new(CollectingSink::new()));
        Self {
            channel,
            placed: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    /// Records an endpoint the scenario added on `key.0`.
    pub fn place(&mut self, key: DeviceKey, endpoint: &StaticEndpoint) {
        let descriptor = self.channel.add_endpoint(endpoint);
        self.owners.insert(descriptor.endpoint_id, key);
        self.placed.insert(key, descriptor);
    }

    pub fn remove(&mut self, key: DeviceKey) {
        if let Some(descriptor) = self.placed.remove(&key) {
            self.channel.remove_endpoint(&descriptor);
            self.owners.remove(&descriptor.endpoint_id);
        }
    }

    pub fn move_to(&mut self, key: DeviceKey, position: Position) {
        if let Some(descriptor) = self.placed.get_mut(&key) {
            self.channel.update_position(descriptor, position);
        }
    }

    pub fn position(&self, key: DeviceKey) -> Option<Position> {
        self.placed.get(&key).map(|d| d.position)
    }

    pub fn set_loss_model(&mut self, model: &LossModelSpec) {
        self.channel.set_loss_model(model);
    }

    pub fn set_delay_model(&mut self, model: &DelayModelSpec) {
        self.channel.set_delay_model(model);
    }

    pub fn device_count(&self) -> usize {
        self.placed.len()
    }

    /// Receptions a transmission from `transmitter` at `tx_time_ns` must
    /// produce.
    pub fn expect(&self, transmitter: DeviceKey, tx_power_dbm: f64, tx_time_ns: u64) -> Vec<ExpectedReception> {
        let Some(descriptor) = self.placed.get(&transmitter) else {
            return Vec::new();
        };
        // The wire carries watts; follow the same conversion.
        let on_air_dbm = watts_to_dbm(dbm_to_watts(tx_power_dbm));

        self.channel
            .preview(descriptor, on_air_dbm)
            .receivers
            .into_iter()
            .filter_map(|link| {
                let receiver = *self.owners.get(&link.endpoint_id?)?;
                Some(ExpectedReception {
                    transmitter,
                    receiver,
                    tx_time_ns,
                    rx_power_dbm: link.budget.rx_power_dbm,
                    arrival_ns: tx_time_ns.saturating_add(link.budget.delay_nanos()),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwave_core::propagation::RangeLoss;

    const WIFI: u32 = 2_400_000_000;

    fn at(x: f64) -> StaticEndpoint {
        StaticEndpoint::new(Position::new(x, 0.0, 0.0), WIFI)
    }

    fn observed_from(e: &ExpectedReception) -> ObservedReception {
        ObservedReception {
            transmitter: e.transmitter,
            receiver: e.receiver,
            tx_time_ns: e.tx_time_ns,
            rx_power_dbm: e.rx_power_dbm,
            arrival_ns: e.arrival_ns,
            delivered_at_ns: e.arrival_ns,
        }
    }

    #[test]
    fn test_oracle_two_devices() {
        let mut oracle = Oracle::new(42, ProcessorConfig::default());
        let a = (Rank(1), EndpointId(1));
        let b = (Rank(2), EndpointId(1));
        oracle.place(a, &at(0.0));
        oracle.place(b, &at(100.0));

        let expected = oracle.expect(a, 20.0, 1_000);
        assert_eq!(expected.len(), 1);
        assert_eq!(expected[0].receiver, b);
        assert_eq!(expected[0].arrival_ns, 1_333);
        assert!((expected[0].rx_power_dbm - -60.05).abs() < 0.01);
    }

    #[test]
    fn test_oracle_tracks_moves_and_models() {
        let mut oracle = Oracle::new(42, ProcessorConfig::default());
        let a = (Rank(1), EndpointId(1));
        let b = (Rank(1), EndpointId(2));
        oracle.place(a, &at(0.0));
        oracle.place(b, &at(10.0));

        oracle.set_loss_model(&LossModelSpec::Range(RangeLoss { max_range_m: 50.0 }));
        assert_eq!(oracle.expect(a, 0.0, 0).len(), 1);

        oracle.move_to(b, Position::new(80.0, 0.0, 0.0));
        assert_eq!(oracle.position(b), Some(Position::new(80.0, 0.0, 0.0)));
        assert!(oracle.expect(a, 0.0, 0).is_empty());

        oracle.remove(b);
        assert_eq!(oracle.device_count(), 1);
        assert!(oracle.expect(b, 0.0, 0).is_empty());
    }

    #[test]
    fn test_compare_exact_match() {
        let mut oracle = Oracle::new(1, ProcessorConfig::default());
        for i in 0..4 {
            oracle.place((Rank(i + 1), EndpointId(1)), &at(i as f64 * 10.0));
        }
        let expected = oracle.expect((Rank(1), EndpointId(1)), 20.0, 0);
        assert_eq!(expected.len(), 3);

        let observed: Vec<_> = expected.iter().rev().map(observed_from).collect();
        let result = compare(&expected, &observed);
        assert!(result.is_exact());
        assert_eq!(result.matched, 3);
        assert_eq!(result.failure_reason(), None);
    }

    #[test]
    fn test_compare_reports_differences() {
        let mut oracle = Oracle::new(1, ProcessorConfig::default());
        oracle.place((Rank(1), EndpointId(1)), &at(0.0));
        oracle.place((Rank(2), EndpointId(1)), &at(10.0));
        oracle.place((Rank(3), EndpointId(1)), &at(20.0));
        let expected = oracle.expect((Rank(1), EndpointId(1)), 20.0, 0);

        let mut late = observed_from(&expected[0]);
        late.delivered_at_ns += 1;
        let mut stray = observed_from(&expected[0]);
        stray.tx_time_ns = 99;

        let result = compare(&expected, &[late, stray]);
        assert_eq!(result.matched, 1);
        assert_eq!(result.mistimed, 1);
        assert_eq!(result.unexpected, 1);
        assert_eq!(result.missing, 1);
        assert!(result.failure_reason().is_some());
    }
}
