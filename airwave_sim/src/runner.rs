//! Scenario runner - executes channel scenarios and checks them against the oracle.

use crate::error::SimError;
use crate::oracle::{compare, Comparison, DeviceKey, ExpectedReception, Oracle};
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use airwave_core::propagation::{ConstantSpeedDelay, FixedDelay, LogDistanceLoss, RangeLoss};
use airwave_core::{
    AirwaveConfig, DelayModelSpec, EndpointId, Frame, LossModelSpec, Position, StaticEndpoint,
};
use airwave_env::{NetworkController, Rank};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const WIFI_HZ: u32 = 2_400_000_000;
const ISM_900_HZ: u32 = 915_000_000;

/// Half-width of the square endpoints are scattered over (meters)
const AREA_HALF_WIDTH_M: f64 = 2_500.0;

/// Standard deviation of one random-walk step per axis (meters)
const MOBILITY_STEP_M: f64 = 25.0;

/// RNG streams
const PLACEMENT_STREAM: u64 = 1;
const TRAFFIC_STREAM: u64 = 2;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Devices registered with the channel at the end
    pub final_device_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn setup_failed(scenario: ScenarioId, seed: u64, error: SimError) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            final_device_count: 0,
            failure_reason: Some(format!("setup failed: {error}")),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Messages the router took off the central queue
    pub messages_routed: u64,

    /// Messages lost to partitions or link loss
    pub messages_dropped: u64,

    /// Transmissions the scenario issued
    pub transmissions: u64,

    /// Transmissions the channel processed
    pub transmissions_processed: u64,

    pub expected_receptions: u64,

    pub observed_receptions: u64,

    /// Receivers the channel evaluated but left below threshold
    pub below_threshold: u64,

    pub registrations: u64,

    pub config_updates: u64,

    /// Oracle match report
    pub comparison: Comparison,
}

/// Runs channel scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of device ranks
    device_ranks: u32,

    /// Endpoints each device rank starts with
    endpoints_per_rank: u32,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Processor and stub settings
    config: AirwaveConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, device_ranks: u32) -> Self {
        Self {
            seed,
            device_ranks,
            endpoints_per_rank: 2,
            tick_rate_hz: 10,
            max_duration_secs: 1.0,
            config: AirwaveConfig::default(),
        }
    }

    pub fn with_endpoints_per_rank(mut self, endpoints: u32) -> Self {
        self.endpoints_per_rank = endpoints.max(1);
        self
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    pub fn with_config(mut self, config: AirwaveConfig) -> Self {
        self.config = config;
        self
    }

    fn target_ticks(&self) -> u64 {
        ((self.max_duration_secs * self.tick_rate_hz as f64) as u64).max(1)
    }

    fn tick(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.tick_rate_hz as u64)
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let device_ranks = match scenario {
            ScenarioId::TwoDevices | ScenarioId::OutOfRange => 2,
            _ => self.device_ranks.max(2),
        };
        let mut session = match Session::new(self, device_ranks) {
            Ok(session) => session,
            Err(e) => return ScenarioResult::setup_failed(scenario, self.seed, e),
        };

        let check = match scenario {
            ScenarioId::TwoDevices => self.run_two_devices(&mut session),
            ScenarioId::OutOfRange => self.run_out_of_range(&mut session),
            ScenarioId::Crowd => self.run_crowd(&mut session),
            ScenarioId::Churn => self.run_churn(&mut session),
            ScenarioId::ModelSwap => self.run_model_swap(&mut session),
            ScenarioId::Partition => self.run_partition(&mut session),
            ScenarioId::Mobility => self.run_mobility(&mut session),
        };

        let result = session.finish(scenario, self.seed, self.target_ticks(), check.err());
        if result.passed {
            info!(
                "✓ {} complete: {} transmissions, {} receptions",
                scenario.name(),
                result.metrics.transmissions,
                result.metrics.observed_receptions
            );
        } else {
            warn!(
                "✗ {} failed: {}",
                scenario.name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
        result
    }

    /// AW-001: two endpoints 100 m apart alternate transmissions.
    ///
    /// **Assertion**: one reception per transmission, at -60.05 dBm,
    /// delivered 333 ns after it was sent.
    fn run_two_devices(&self, s: &mut Session) -> Result<(), String> {
        let a = s.place(Rank(1), StaticEndpoint::new(Position::new(0.0, 0.0, 0.0), WIFI_HZ));
        let b = s.place(Rank(2), StaticEndpoint::new(Position::new(100.0, 0.0, 0.0), WIFI_HZ));
        s.settle();

        for tick in 0..self.target_ticks() {
            let transmitter = if tick % 2 == 0 { a } else { b };
            s.transmit(transmitter, 20.0, tick);
            s.world.advance(self.tick());
        }

        let observed = s.world.observed();
        if observed.len() as u64 != self.target_ticks() {
            return Err(format!("{} receptions for {} transmissions", observed.len(), self.target_ticks()));
        }
        for o in &observed {
            if (o.rx_power_dbm - -60.05).abs() > 0.01 {
                return Err(format!("received {:.3} dBm at 100 m", o.rx_power_dbm));
            }
            if o.delivered_at_ns - o.tx_time_ns != 333 {
                return Err(format!("delivered {} ns after sending", o.delivered_at_ns - o.tx_time_ns));
            }
        }
        Ok(())
    }

    /// AW-002: two endpoints 100 km apart.
    ///
    /// **Assertion**: nothing is delivered; every evaluation is below threshold.
    fn run_out_of_range(&self, s: &mut Session) -> Result<(), String> {
        let a = s.place(Rank(1), StaticEndpoint::new(Position::new(0.0, 0.0, 0.0), WIFI_HZ));
        s.place(Rank(2), StaticEndpoint::new(Position::new(100_000.0, 0.0, 0.0), WIFI_HZ));
        s.settle();

        for tick in 0..self.target_ticks() {
            s.transmit(a, 20.0, tick);
            s.world.advance(self.tick());
        }

        let stats = s.world.processor().stats();
        if stats.below_threshold != stats.transmissions || stats.notifications_sent != 0 {
            return Err(format!(
                "{} of {} evaluations below threshold, {} notifications",
                stats.below_threshold, stats.transmissions, stats.notifications_sent
            ));
        }
        Ok(())
    }

    /// AW-003: every rank hosts several endpoints on two bands; random
    /// transmitters each tick.
    fn run_crowd(&self, s: &mut Session) -> Result<(), String> {
        s.populate(self.endpoints_per_rank);
        for tick in 0..self.target_ticks() {
            s.random_transmissions(4, tick);
            s.world.advance(self.tick());
        }
        Ok(())
    }

    /// AW-004: one endpoint leaves and another joins every tick.
    ///
    /// **Assertion**: every registration got a fresh device id, and the
    /// channel's registry matches the live endpoints.
    fn run_churn(&self, s: &mut Session) -> Result<(), String> {
        s.populate(self.endpoints_per_rank);
        let ranks = s.world.device_ranks();

        for tick in 0..self.target_ticks() {
            if s.live.len() > 2 {
                let index = s.traffic.gen_range(0..s.live.len());
                let key = s.live[index];
                s.remove(key);
            }
            if let Some(&rank) = ranks.choose(&mut s.traffic) {
                s.place_random(rank);
            }
            s.world.heartbeat_all();
            s.random_transmissions(2, tick);
            s.world.advance(self.tick());
        }

        let processor = s.world.processor();
        let ids = processor.registry().ids();
        if ids.len() != s.live.len() {
            return Err(format!("registry holds {} devices, {} live", ids.len(), s.live.len()));
        }
        let registrations = processor.stats().registrations as usize;
        if registrations != s.placed_total {
            return Err(format!("{registrations} registrations for {} placements", s.placed_total));
        }
        if ids.iter().any(|id| id.0 as usize > s.placed_total) || processor.stats().heartbeats == 0 {
            return Err("device ids reused or heartbeats missing".to_string());
        }
        Ok(())
    }

    /// AW-005: models replaced from different ranks mid-run.
    fn run_model_swap(&self, s: &mut Session) -> Result<(), String> {
        s.populate(self.endpoints_per_rank);
        let ticks = self.target_ticks();
        let phases = [ticks / 4, ticks / 2, 3 * ticks / 4];

        for tick in 0..ticks {
            if tick == phases[0] {
                info!("  Installing range loss at t={:.2}s", s.world.time());
                s.set_loss_model(Rank(1), LossModelSpec::Range(RangeLoss { max_range_m: 1_500.0 }));
            }
            if tick == phases[1] {
                info!("  Installing log-distance loss at t={:.2}s", s.world.time());
                s.set_loss_model(
                    Rank(2),
                    LossModelSpec::LogDistance(LogDistanceLoss {
                        exponent: 2.2,
                        ..Default::default()
                    }),
                );
                s.set_delay_model(Rank(2), DelayModelSpec::Fixed(FixedDelay { delay_nanos: 1_000 }));
            }
            if tick == phases[2] {
                s.set_delay_model(Rank(1), DelayModelSpec::ConstantSpeed(ConstantSpeedDelay::default()));
            }
            s.random_transmissions(4, tick);
            s.world.advance(self.tick());
        }

        let stats = s.world.processor().stats();
        if stats.config_updates != s.config_updates || stats.rejected_configs != 0 {
            return Err(format!(
                "{} of {} configuration updates applied",
                stats.config_updates, s.config_updates
            ));
        }
        Ok(())
    }

    /// AW-006: rank 1 loses its link to the channel for the middle third.
    ///
    /// **Assertion**: rank 1 neither transmits nor receives while cut off;
    /// every other rank is unaffected; rank 1 recovers after healing.
    fn run_partition(&self, s: &mut Session) -> Result<(), String> {
        s.populate(self.endpoints_per_rank);
        let ticks = self.target_ticks();
        let isolated = Rank(1);
        let channel = s.world.channel_rank();
        let (start, end) = (ticks / 3, (2 * ticks / 3).max(ticks / 3 + 1));

        for tick in 0..ticks {
            if tick == start {
                info!("  Partitioning {} from the channel at t={:.2}s", isolated, s.world.time());
                s.world.controller().partition(&[isolated], &[channel]);
                s.isolated = Some(isolated);
            }
            if tick == end {
                info!("  Healing partition at t={:.2}s", s.world.time());
                s.world.controller().heal_all();
                s.isolated = None;
            }
            s.random_transmissions(4, tick);
            // Rank 1 always gets a turn so the partition is exercised
            if let Some(&key) = s.live.iter().find(|k| k.0 == isolated) {
                s.transmit(key, 20.0, tick);
            }
            s.world.advance(self.tick());
        }

        if s.world.router_stats().dropped_partition == 0 {
            return Err("partition dropped nothing".to_string());
        }
        Ok(())
    }

    /// AW-007: every endpoint takes a random-walk step each tick.
    fn run_mobility(&self, s: &mut Session) -> Result<(), String> {
        s.populate(self.endpoints_per_rank);
        for tick in 0..self.target_ticks() {
            for key in s.live.clone() {
                let Some(current) = s.oracle.position(key) else { continue };
                let step = Position::new(
                    s.traffic.sample::<f64, _>(StandardNormal) * MOBILITY_STEP_M,
                    s.traffic.sample::<f64, _>(StandardNormal) * MOBILITY_STEP_M,
                    0.0,
                );
                s.move_to(key, current + step);
            }
            s.random_transmissions(4, tick);
            s.world.advance(self.tick());
        }

        let moved = s.world.processor().stats().position_updates;
        if moved == 0 {
            return Err("no position updates reached the channel".to_string());
        }
        Ok(())
    }
}

/// One scenario run: the world, its oracle, and what should happen.
struct Session {
    world: SimWorld,
    oracle: Oracle,
    placement: ChaCha8Rng,
    traffic: ChaCha8Rng,
    expected: Vec<ExpectedReception>,
    /// Endpoints currently placed, in placement order
    live: Vec<DeviceKey>,
    placed_total: usize,
    transmissions: u64,
    config_updates: u64,
    /// Rank currently cut off from the channel
    isolated: Option<Rank>,
}

impl Session {
    fn new(runner: &ScenarioRunner, device_ranks: u32) -> Result<Self, SimError> {
        let world = SimWorld::new(SimConfig {
            seed: runner.seed,
            device_ranks,
            airwave: runner.config.clone(),
        })?;
        let oracle = Oracle::new(runner.seed, runner.config.processor.clone());
        let placement = world.derive_rng(PLACEMENT_STREAM);
        let traffic = world.derive_rng(TRAFFIC_STREAM);

        Ok(Self {
            world,
            oracle,
            placement,
            traffic,
            expected: Vec::new(),
            live: Vec::new(),
            placed_total: 0,
            transmissions: 0,
            config_updates: 0,
            isolated: None,
        })
    }

    fn place(&mut self, rank: Rank, endpoint: StaticEndpoint) -> DeviceKey {
        let endpoint_id = match self.world.device_mut(rank) {
            Some(device) => device.add_endpoint(&endpoint),
            None => {
                warn!(%rank, "No such device rank");
                return (rank, EndpointId(0));
            }
        };
        let key = (rank, endpoint_id);
        self.oracle.place(key, &endpoint);
        self.live.push(key);
        self.placed_total += 1;
        key
    }

    fn place_random(&mut self, rank: Rank) -> DeviceKey {
        let position = Position::new(
            self.placement.gen_range(-AREA_HALF_WIDTH_M..AREA_HALF_WIDTH_M),
            self.placement.gen_range(-AREA_HALF_WIDTH_M..AREA_HALF_WIDTH_M),
            self.placement.gen_range(0.0..30.0),
        );
        let frequency_hz = if self.placement.gen_bool(0.8) { WIFI_HZ } else { ISM_900_HZ };
        let gain_db = self.placement.gen_range(0.0..6.0);
        self.place(rank, StaticEndpoint::new(position, frequency_hz).with_gain(gain_db))
    }

    /// Places `per_rank` random endpoints on every device rank.
    fn populate(&mut self, per_rank: u32) {
        for rank in self.world.device_ranks() {
            for _ in 0..per_rank {
                self.place_random(rank);
            }
        }
        self.settle();
    }

    fn remove(&mut self, key: DeviceKey) {
        if let Some(device) = self.world.device_mut(key.0) {
            device.remove_endpoint(key.1);
        }
        self.oracle.remove(key);
        self.live.retain(|k| *k != key);
    }

    fn move_to(&mut self, key: DeviceKey, position: Position) {
        if let Some(device) = self.world.device_mut(key.0) {
            device.move_endpoint(key.1, position);
        }
        self.oracle.move_to(key, position);
    }

    fn set_loss_model(&mut self, via: Rank, model: LossModelSpec) {
        if let Some(device) = self.world.device_mut(via) {
            device.set_loss_model(&model);
            self.config_updates += 1;
        }
        self.oracle.set_loss_model(&model);
    }

    fn set_delay_model(&mut self, via: Rank, model: DelayModelSpec) {
        if let Some(device) = self.world.device_mut(via) {
            device.set_delay_model(&model);
            self.config_updates += 1;
        }
        self.oracle.set_delay_model(&model);
    }

    fn transmit(&mut self, key: DeviceKey, tx_power_dbm: f64, tick: u64) {
        let now = self.world.now_ns();
        let frame = Frame::new(tick.to_le_bytes().to_vec());
        let sent = self
            .world
            .device_mut(key.0)
            .map(|device| device.transmit(key.1, &frame, tx_power_dbm))
            .unwrap_or(false);
        if !sent {
            return;
        }
        self.transmissions += 1;

        let isolated = self.isolated;
        let expected = self.oracle.expect(key, tx_power_dbm, now);
        debug!(rank = %key.0, endpoint = %key.1, expected = expected.len(), "Transmission");
        self.expected.extend(
            expected
                .into_iter()
                .filter(|e| Some(e.transmitter.0) != isolated && Some(e.receiver.0) != isolated),
        );
    }

    fn random_transmissions(&mut self, count: usize, tick: u64) {
        for _ in 0..count {
            let Some(&key) = self.live.choose(&mut self.traffic) else { return };
            let power = self.traffic.gen_range(0.0..20.0);
            self.transmit(key, power, tick);
        }
    }

    /// Lets registrations and acknowledgements settle.
    fn settle(&mut self) {
        self.world.route();
        self.world.advance(Duration::from_micros(1));
    }

    fn finish(
        mut self,
        scenario: ScenarioId,
        seed: u64,
        total_ticks: u64,
        check: Option<String>,
    ) -> ScenarioResult {
        // Long links can still be in flight
        self.world.advance(Duration::from_millis(1));

        let observed = self.world.observed();
        let comparison = compare(&self.expected, &observed);
        let router = self.world.router_stats();
        let stats = self.world.processor().stats();

        let failure_reason = comparison
            .failure_reason()
            .map(|r| format!("oracle mismatch: {r}"))
            .or(check);

        ScenarioResult {
            scenario,
            seed,
            passed: failure_reason.is_none(),
            total_ticks,
            final_time_secs: self.world.time(),
            final_device_count: self.world.processor().registry().len(),
            failure_reason,
            metrics: ScenarioMetrics {
                messages_routed: router.routed,
                messages_dropped: router.dropped(),
                transmissions: self.transmissions,
                transmissions_processed: stats.transmissions,
                expected_receptions: self.expected.len() as u64,
                observed_receptions: observed.len() as u64,
                below_threshold: stats.below_threshold,
                registrations: stats.registrations,
                config_updates: stats.config_updates,
                comparison,
            },
        }
    }
}
