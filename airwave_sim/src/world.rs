//! SimWorld - The simulation harness container.
//!
//! One channel rank runs the [`ChannelProcessor`]; every other rank is a
//! [`SimulatedDevice`]. All ranks share one [`SimClock`] and one router.

use crate::context::{SimClock, SimContext};
use crate::device::SimulatedDevice;
use crate::error::SimError;
use crate::network::{RouterStats, SimNetwork, SimNetworkController, SimRouter};
use crate::oracle::{DeviceKey, ObservedReception};

use airwave_core::{AirwaveConfig, ChannelProcessor, DeviceId, MessageDispatcher};
use airwave_env::{NetworkTransport, Rank};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of device ranks next to the channel rank
    pub device_ranks: u32,

    /// Processor and stub settings
    pub airwave: AirwaveConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            device_ranks: 4,
            airwave: AirwaveConfig::default(),
        }
    }
}

type SimProcessor = ChannelProcessor<SimContext, SimNetwork>;

/// The channel rank.
struct ChannelHost {
    ctx: Arc<SimContext>,
    net: Arc<SimNetwork>,
    dispatcher: MessageDispatcher,
    processor: Arc<Mutex<SimProcessor>>,
}

impl ChannelHost {
    fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some((source, bytes)) = self.net.try_recv() {
            self.dispatcher.deliver(&bytes, source);
            handled += 1;
        }
        handled
    }
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared virtual clock
    clock: Arc<SimClock>,

    /// Network controller for fault injection
    controller: Arc<SimNetworkController>,

    router: SimRouter,

    channel: ChannelHost,

    devices: BTreeMap<Rank, SimulatedDevice>,

    /// Every global id the channel has handed out, for mapping receptions
    /// back to `(rank, endpoint)` after the device is gone
    identities: Arc<Mutex<HashMap<DeviceId, DeviceKey>>>,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        let world_size = config.device_ranks + 1;
        let channel_rank = config.airwave.processor.channel_rank;
        if channel_rank.as_u32() >= world_size {
            return Err(SimError::ChannelRankOutOfRange {
                rank: channel_rank,
                world_size,
            });
        }

        // Derive separate seeds for different subsystems
        let network_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);

        let clock = SimClock::shared();
        let controller = Arc::new(SimNetworkController::new(network_seed));
        let (router, nets) = SimNetwork::mesh(world_size, clock.clone(), controller.clone());

        let identities: Arc<Mutex<HashMap<DeviceId, DeviceKey>>> = Arc::new(Mutex::new(HashMap::new()));
        let channel_ctx = SimContext::shared(clock.clone(), channel_rank, world_size, config.seed);
        let channel_net = nets[channel_rank.as_u32() as usize].clone();
        let mut processor =
            ChannelProcessor::new(channel_ctx.clone(), channel_net.clone(), config.airwave.processor.clone());
        processor.initialize()?;
        processor.start_processing()?;
        let known = identities.clone();
        processor.set_registration_callback(move |device_id, rank, endpoint| {
            known
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(device_id, (rank, endpoint));
        });

        let mut dispatcher = MessageDispatcher::new();
        let processor = processor.attach(&mut dispatcher);
        let channel = ChannelHost {
            ctx: channel_ctx,
            net: channel_net,
            dispatcher,
            processor,
        };

        let mut stub_config = config.airwave.stub.clone();
        stub_config.channel_rank = channel_rank;
        let devices = nets
            .iter()
            .filter(|net| net.local_rank() != channel_rank)
            .map(|net| {
                let rank = net.local_rank();
                let ctx = SimContext::shared(clock.clone(), rank, world_size, config.seed);
                (rank, SimulatedDevice::new(ctx, net.clone(), stub_config.clone()))
            })
            .collect();

        info!(seed = config.seed, world_size, %channel_rank, "Simulation world created");

        Ok(Self {
            config,
            clock,
            controller,
            router,
            channel,
            devices,
            identities,
        })
    }

    pub fn clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    /// Returns the current simulation time in nanoseconds.
    pub fn now_ns(&self) -> u64 {
        self.clock.time_ns()
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.now_ns() as f64 / 1e9
    }

    /// Deterministic RNG for one scenario concern, derived from the seed.
    pub fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        self.channel.ctx.derive_rng(stream)
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        &self.controller
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn channel_rank(&self) -> Rank {
        self.config.airwave.processor.channel_rank
    }

    pub fn device_ranks(&self) -> Vec<Rank> {
        self.devices.keys().copied().collect()
    }

    pub fn device(&self, rank: Rank) -> Option<&SimulatedDevice> {
        self.devices.get(&rank)
    }

    pub fn device_mut(&mut self, rank: Rank) -> Option<&mut SimulatedDevice> {
        self.devices.get_mut(&rank)
    }

    pub fn devices(&self) -> impl Iterator<Item = &SimulatedDevice> + '_ {
        self.devices.values()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut SimulatedDevice> + '_ {
        self.devices.values_mut()
    }

    /// Locks the channel processor.
    pub fn processor(&self) -> MutexGuard<'_, SimProcessor> {
        self.channel.processor.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `(rank, endpoint)` behind a global device id.
    pub fn identity(&self, device_id: DeviceId) -> Option<DeviceKey> {
        self.identities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&device_id)
            .copied()
    }

    /// Moves messages and runs due events until nothing is left to do at
    /// the current instant. Returns the amount of work done.
    pub fn route(&mut self) -> usize {
        let mut total = 0;
        loop {
            let mut moved = self.router.route_pending();
            moved += self.channel.pump();
            for device in self.devices.values_mut() {
                moved += device.pump();
            }
            moved += self.clock.run_due();
            if moved == 0 {
                return total;
            }
            total += moved;
        }
    }

    /// Runs the world up to `time_ns`, handling everything due on the way.
    pub fn run_until(&mut self, time_ns: u64) {
        loop {
            self.route();
            match self.clock.next_event_ns() {
                Some(next) if next <= time_ns => {
                    self.clock.run_until(next);
                }
                _ => break,
            }
        }
        self.clock.run_until(time_ns);
        self.route();
    }

    /// Advances virtual time by `duration`.
    pub fn advance(&mut self, duration: Duration) {
        let step = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.run_until(self.now_ns().saturating_add(step));
    }

    /// Sends a heartbeat from every device rank.
    pub fn heartbeat_all(&mut self) {
        for device in self.devices.values_mut() {
            device.heartbeat();
        }
    }

    fn observe(&self, device: &SimulatedDevice, drain: bool) -> Vec<ObservedReception> {
        let receptions = if drain {
            device.drain_receptions()
        } else {
            device.receptions()
        };
        receptions
            .into_iter()
            .filter_map(|timed| {
                let n = &timed.reception.notification;
                let Some(transmitter) = self.identity(timed.reception.transmitter()) else {
                    warn!(device_id = n.transmitter_device_id, "Reception from unknown transmitter");
                    return None;
                };
                Some(ObservedReception {
                    transmitter,
                    receiver: (device.rank(), timed.reception.endpoint_id),
                    tx_time_ns: n.tx_timestamp_nanos,
                    rx_power_dbm: n.rx_power_dbm,
                    arrival_ns: n.arrival_nanos(),
                    delivered_at_ns: timed.delivered_at_ns,
                })
            })
            .collect()
    }

    /// Every reception delivered so far, across all device ranks.
    pub fn observed(&self) -> Vec<ObservedReception> {
        self.devices.values().flat_map(|d| self.observe(d, false)).collect()
    }

    /// Like [`observed`](Self::observed), but clears the sinks.
    pub fn drain_observed(&self) -> Vec<ObservedReception> {
        self.devices.values().flat_map(|d| self.observe(d, true)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwave_core::{
        EndpointId, Frame, PayloadMode, Position, ProcessorConfig, StaticEndpoint, StubConfig,
    };
    use airwave_env::NetworkController;

    const WIFI: u32 = 2_400_000_000;

    fn world(device_ranks: u32) -> SimWorld {
        SimWorld::new(SimConfig {
            seed: 42,
            device_ranks,
            ..Default::default()
        })
        .unwrap()
    }

    fn place(world: &mut SimWorld, rank: u32, x: f64) -> EndpointId {
        world
            .device_mut(Rank(rank))
            .unwrap()
            .add_endpoint(&StaticEndpoint::new(Position::new(x, 0.0, 0.0), WIFI))
    }

    #[test]
    fn test_sim_world_creation() {
        let world = world(3);
        assert_eq!(world.device_ranks(), vec![Rank(1), Rank(2), Rank(3)]);
        assert_eq!(world.channel_rank(), Rank(0));
        assert!(world.processor().is_processing());
        assert_eq!(world.now_ns(), 0);
    }

    #[test]
    fn test_sim_world_rejects_bad_channel_rank() {
        let mut config = SimConfig {
            device_ranks: 2,
            ..Default::default()
        };
        config.airwave.processor = ProcessorConfig {
            channel_rank: Rank(5),
            ..Default::default()
        };
        assert!(matches!(
            SimWorld::new(config),
            Err(SimError::ChannelRankOutOfRange { world_size: 3, .. })
        ));
    }

    #[test]
    fn test_registration_is_acknowledged() {
        let mut world = world(2);
        let a = place(&mut world, 1, 0.0);
        let b = place(&mut world, 2, 50.0);
        world.route();

        assert_eq!(world.processor().registry().len(), 2);
        assert_eq!(world.device(Rank(1)).unwrap().device_id(a), Some(DeviceId(1)));
        assert_eq!(world.device(Rank(2)).unwrap().device_id(b), Some(DeviceId(2)));
        assert_eq!(world.identity(DeviceId(2)), Some((Rank(2), b)));
    }

    #[test]
    fn test_reception_lands_at_arrival_time() {
        let mut world = world(2);
        let a = place(&mut world, 1, 0.0);
        let b = place(&mut world, 2, 100.0);
        world.route();

        world.advance(Duration::from_micros(1));
        world
            .device_mut(Rank(1))
            .unwrap()
            .transmit(a, &Frame::new(&b"ping"[..]), 20.0);
        world.route();
        assert!(world.observed().is_empty());

        world.advance(Duration::from_micros(1));
        let observed = world.observed();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].transmitter, (Rank(1), a));
        assert_eq!(observed[0].receiver, (Rank(2), b));
        assert_eq!(observed[0].tx_time_ns, 1_000);
        assert_eq!(observed[0].delivered_at_ns, 1_333);
        assert_eq!(observed[0].arrival_ns, 1_333);
    }

    #[test]
    fn test_size_only_stub_still_reports_frame_size() {
        let mut config = SimConfig {
            device_ranks: 2,
            ..Default::default()
        };
        config.airwave.stub = StubConfig {
            payload_mode: PayloadMode::SizeOnly,
            ..Default::default()
        };
        let mut world = SimWorld::new(config).unwrap();
        let a = place(&mut world, 1, 0.0);
        place(&mut world, 2, 100.0);
        world.route();

        let frame = Frame::new(vec![0u8; 1500]).with_duration(Duration::from_micros(248));
        world.device_mut(Rank(1)).unwrap().transmit(a, &frame, 20.0);
        world.advance(Duration::from_micros(1));

        let heard = world.device(Rank(2)).unwrap().receptions();
        assert_eq!(heard.len(), 1);
        let notification = &heard[0].reception.notification;
        assert_eq!(notification.frame_size_bytes, 1500);
        assert_eq!(notification.duration(), Some(Duration::from_micros(248)));
        assert!(notification.payload.is_empty());
    }

    #[test]
    fn test_partitioned_device_is_silent() {
        let mut world = world(2);
        let a = place(&mut world, 1, 0.0);
        place(&mut world, 2, 10.0);
        world.route();

        world.controller().partition(&[Rank(1)], &[Rank(0)]);
        world.device_mut(Rank(1)).unwrap().transmit(a, &Frame::default(), 20.0);
        world.advance(Duration::from_micros(10));

        assert!(world.observed().is_empty());
        assert_eq!(world.processor().stats().transmissions, 0);
        assert_eq!(world.router_stats().dropped_partition, 1);
    }

    #[test]
    fn test_sim_world_determinism() {
        let run = || {
            let mut world = world(3);
            for rank in 1..=3 {
                place(&mut world, rank, rank as f64 * 30.0);
            }
            world.route();
            for rank in 1..=3 {
                world
                    .device_mut(Rank(rank))
                    .unwrap()
                    .transmit(EndpointId(1), &Frame::default(), 15.0);
            }
            world.advance(Duration::from_millis(1));
            let mut observed = world.drain_observed();
            observed.sort_by_key(|o| (o.transmitter, o.receiver));
            observed
        };
        let first = run();
        assert_eq!(first.len(), 6);
        assert_eq!(first, run());
    }
}
