//! SimulatedDevice - a device rank driving the remote channel stub.
//!
//! Each device rank owns its network handle, a dispatcher for inbound
//! messages, the stub, and a sink that stamps every reception with the
//! virtual time it was delivered at.

use crate::context::{SimClock, SimContext};
use crate::network::SimNetwork;

use airwave_core::{
    ChannelTransport, DelayModelSpec, DeviceId, EndpointDescriptor, EndpointId, Frame,
    LossModelSpec, MessageDispatcher, Position, Reception, ReceptionSink, RemoteChannelStub,
    StaticEndpoint, StubConfig, StubStats,
};
use airwave_env::{ChannelContext, Rank};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// A reception together with the virtual time the sink saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedReception {
    pub delivered_at_ns: u64,
    pub reception: Reception,
}

/// Keeps every reception with its delivery time.
pub struct TimedSink {
    clock: Arc<SimClock>,
    received: Mutex<Vec<TimedReception>>,
}

impl TimedSink {
    pub fn new(clock: Arc<SimClock>) -> Self {
        Self {
            clock,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn receptions(&self) -> Vec<TimedReception> {
        self.received.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<TimedReception> {
        std::mem::take(&mut *self.received.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl ReceptionSink for TimedSink {
    fn on_reception(&self, reception: Reception) {
        let delivered_at_ns = self.clock.time_ns();
        self.received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(TimedReception {
                delivered_at_ns,
                reception,
            });
    }
}

type SimStub = RemoteChannelStub<SimContext, SimNetwork>;

/// A simulated device rank.
pub struct SimulatedDevice {
    rank: Rank,

    net: Arc<SimNetwork>,

    /// Routes channel replies to the stub
    dispatcher: MessageDispatcher,

    stub: Arc<Mutex<SimStub>>,

    sink: Arc<TimedSink>,

    /// Endpoints this rank has added, by local id
    endpoints: BTreeMap<EndpointId, EndpointDescriptor>,
}

impl SimulatedDevice {
    /// Creates a device rank whose stub talks to `config.channel_rank`.
    pub fn new(ctx: Arc<SimContext>, net: Arc<SimNetwork>, config: StubConfig) -> Self {
        let rank = ctx.rank();
        let sink = Arc::new(TimedSink::new(ctx.clock().clone()));
        let mut dispatcher = MessageDispatcher::new();
        let stub = RemoteChannelStub::new(ctx, net.clone(), config, sink.clone()).attach(&mut dispatcher);

        Self {
            rank,
            net,
            dispatcher,
            stub,
            sink,
            endpoints: BTreeMap::new(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    fn stub(&self) -> MutexGuard<'_, SimStub> {
        self.stub.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Adds an endpoint and returns its local id.
    pub fn add_endpoint(&mut self, endpoint: &StaticEndpoint) -> EndpointId {
        let descriptor = self.stub().add_endpoint(endpoint);
        let endpoint_id = descriptor.endpoint_id;
        debug!(rank = %self.rank, endpoint = %endpoint_id, "Device endpoint added");
        self.endpoints.insert(endpoint_id, descriptor);
        endpoint_id
    }

    pub fn endpoint(&self, endpoint_id: EndpointId) -> Option<&EndpointDescriptor> {
        self.endpoints.get(&endpoint_id)
    }

    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.endpoints.keys().copied().collect()
    }

    /// Transmits from a local endpoint. Returns false for unknown endpoints.
    pub fn transmit(&mut self, endpoint_id: EndpointId, frame: &Frame, tx_power_dbm: f64) -> bool {
        let Some(descriptor) = self.endpoints.get(&endpoint_id) else {
            warn!(rank = %self.rank, endpoint = %endpoint_id, "Transmit from unknown endpoint");
            return false;
        };
        self.stub().transmit(descriptor, frame, tx_power_dbm);
        true
    }

    /// Moves a local endpoint. Returns false for unknown endpoints.
    pub fn move_endpoint(&mut self, endpoint_id: EndpointId, position: Position) -> bool {
        let stub = self.stub.clone();
        let Some(descriptor) = self.endpoints.get_mut(&endpoint_id) else {
            return false;
        };
        stub.lock()
            .unwrap_or_else(|p| p.into_inner())
            .update_position(descriptor, position);
        true
    }

    /// Removes a local endpoint. Returns false for unknown endpoints.
    pub fn remove_endpoint(&mut self, endpoint_id: EndpointId) -> bool {
        let Some(descriptor) = self.endpoints.remove(&endpoint_id) else {
            return false;
        };
        self.stub().remove_endpoint(&descriptor);
        true
    }

    pub fn set_loss_model(&mut self, model: &LossModelSpec) {
        self.stub().set_loss_model(model);
    }

    pub fn set_delay_model(&mut self, model: &DelayModelSpec) {
        self.stub().set_delay_model(model);
    }

    pub fn heartbeat(&mut self) -> bool {
        self.stub().heartbeat()
    }

    /// Delivers everything waiting in this rank's inbox. Returns how many
    /// messages were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some((source, bytes)) = self.net.try_recv() {
            self.dispatcher.deliver(&bytes, source);
            handled += 1;
        }
        handled
    }

    /// Global id the channel assigned to a local endpoint, once acknowledged.
    pub fn device_id(&self, endpoint_id: EndpointId) -> Option<DeviceId> {
        self.stub().device_id(endpoint_id)
    }

    pub fn receptions(&self) -> Vec<TimedReception> {
        self.sink.receptions()
    }

    pub fn drain_receptions(&self) -> Vec<TimedReception> {
        self.sink.drain()
    }

    pub fn stats(&self) -> StubStats {
        self.stub().counters().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::SimNetworkController;
    use airwave_core::message::ReceptionNotification;
    use airwave_core::{Message, MessageKind};
    use airwave_env::NetworkTransport;

    const WIFI: u32 = 2_400_000_000;

    #[test]
    fn test_device_sends_through_router() {
        let clock = SimClock::shared();
        let controller = Arc::new(SimNetworkController::new(0));
        let (mut router, nets) = SimNetwork::mesh(2, clock.clone(), controller);
        let ctx = SimContext::shared(clock, Rank(1), 2, 42);
        let mut device = SimulatedDevice::new(ctx, nets[1].clone(), StubConfig::default());

        let id = device.add_endpoint(&StaticEndpoint::new(Position::new(1.0, 2.0, 3.0), WIFI));
        assert_eq!(id, EndpointId(1));
        assert!(device.transmit(id, &Frame::new(&b"abc"[..]), 10.0));
        assert!(!device.transmit(EndpointId(9), &Frame::default(), 10.0));
        assert!(device.move_endpoint(id, Position::new(5.0, 0.0, 0.0)));
        assert_eq!(device.endpoint(id).map(|d| d.position), Some(Position::new(5.0, 0.0, 0.0)));

        router.route_pending();
        let mut kinds = Vec::new();
        while let Some((source, bytes)) = nets[0].try_recv() {
            assert_eq!(source, Rank(1));
            kinds.push(Message::deserialize(&bytes).unwrap().kind());
        }
        assert_eq!(
            kinds,
            vec![MessageKind::DeviceRegister, MessageKind::TxRequest, MessageKind::PositionUpdate]
        );
        assert_eq!(device.stats().frames_sent, 1);
        assert_eq!(nets[1].local_rank(), Rank(1));
    }

    #[test]
    fn test_timed_sink_stamps_clock() {
        let clock = SimClock::shared();
        let sink = TimedSink::new(clock.clone());
        clock.advance_to(777);

        sink.on_reception(Reception {
            endpoint_id: EndpointId(1),
            notification: ReceptionNotification {
                receiver_device_id: 2,
                transmitter_device_id: 1,
                rx_power_dbm: -60.0,
                path_loss_db: 80.0,
                distance_m: 100.0,
                frequency_hz: WIFI,
                propagation_delay_nanos: 333,
                tx_timestamp_nanos: 444,
                frame_size_bytes: 0,
                duration_nanos: 0,
                payload: Default::default(),
            },
        });
        assert_eq!(sink.receptions()[0].delivered_at_ns, 777);
        assert_eq!(sink.drain().len(), 1);
        assert!(sink.is_empty());
    }
}
