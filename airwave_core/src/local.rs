//! Local-direct channel.
//!
//! Implements [`ChannelTransport`] without any messaging: registry and
//! propagation live in the same process as the endpoints. Used for
//! single-process runs and as the reference the distributed path is
//! compared against.

use crate::config::ProcessorConfig;
use crate::endpoint::{
    ChannelTransport, EndpointDescriptor, Frame, Reception, ReceptionSink, WirelessEndpoint,
};
use crate::message::{duration_to_nanos, ReceptionNotification};
use crate::metrics::StubCounters;
use crate::processor::{evaluate_transmission, FanOut};
use crate::propagation::{DelayModelSpec, LossModelSpec, PropagationEngine};
use crate::registry::{DeviceRegistry, NewDevice};
use crate::types::{DeviceId, EndpointId, Position};
use airwave_env::ChannelContext;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct LocalChannel<Ctx: ChannelContext> {
    ctx: Arc<Ctx>,
    config: ProcessorConfig,
    registry: DeviceRegistry,
    engine: PropagationEngine,
    next_endpoint: u32,
    counters: Arc<StubCounters>,
    sink: Arc<dyn ReceptionSink>,
}

impl<Ctx: ChannelContext> LocalChannel<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: ProcessorConfig, sink: Arc<dyn ReceptionSink>) -> Self {
        Self {
            ctx,
            config,
            registry: DeviceRegistry::new(),
            engine: PropagationEngine::default(),
            next_endpoint: 0,
            counters: Arc::new(StubCounters::new()),
            sink,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &PropagationEngine {
        &self.engine
    }

    pub fn counters(&self) -> Arc<StubCounters> {
        self.counters.clone()
    }

    pub fn device_id(&self, endpoint: EndpointId) -> Option<DeviceId> {
        self.registry.resolve(self.ctx.rank(), endpoint)
    }

    /// Receivers a transmission would reach right now, without sending it.
    pub fn preview(&self, endpoint: &EndpointDescriptor, tx_power_dbm: f64) -> FanOut {
        match self.device_id(endpoint.endpoint_id) {
            Some(transmitter) => evaluate_transmission(
                &self.registry,
                &self.engine,
                transmitter,
                tx_power_dbm,
                endpoint.frequency_hz,
                self.config.reception_threshold_dbm,
            ),
            None => FanOut::default(),
        }
    }

    fn deliver(&self, reception: Reception) {
        let arrival = reception.notification.arrival_nanos();
        if arrival <= self.ctx.now_nanos() {
            self.counters.record_reception();
            self.sink.on_reception(reception);
            return;
        }

        let sink = self.sink.clone();
        let counters = self.counters.clone();
        self.ctx.schedule_at(
            Duration::from_nanos(arrival),
            Box::new(move || {
                counters.record_reception();
                sink.on_reception(reception);
            }),
        );
    }
}

impl<Ctx: ChannelContext> ChannelTransport for LocalChannel<Ctx> {
    fn add_endpoint(&mut self, endpoint: &dyn WirelessEndpoint) -> EndpointDescriptor {
        self.counters.record_endpoint_added();
        self.next_endpoint += 1;
        let descriptor = EndpointDescriptor::from_endpoint(EndpointId(self.next_endpoint), endpoint);

        let registration = self.registry.register_endpoint(NewDevice {
            owner_rank: self.ctx.rank(),
            endpoint_id: descriptor.endpoint_id,
            position: descriptor.position,
            antenna_gain_db: descriptor.parameters.antenna_gain_db,
            frequency_hz: descriptor.frequency_hz,
            now_nanos: self.ctx.now_nanos(),
        });
        debug!(endpoint = %descriptor.endpoint_id, device_id = %registration.device_id, "Local endpoint added");
        descriptor
    }

    fn transmit(&mut self, endpoint: &EndpointDescriptor, frame: &Frame, tx_power_dbm: f64) {
        self.counters.record_frame_sent();
        let Some(transmitter) = self.device_id(endpoint.endpoint_id) else {
            warn!(endpoint = %endpoint.endpoint_id, "Transmission from unregistered endpoint");
            return;
        };

        let now = self.ctx.now_nanos();
        self.registry.touch(transmitter, now);
        let fan_out = self.preview(endpoint, tx_power_dbm);
        let echo = if self.config.echo_payload {
            frame.bytes.clone()
        } else {
            Bytes::new()
        };

        for link in fan_out.receivers {
            let reception = Reception {
                endpoint_id: link.endpoint_id.unwrap_or(EndpointId(0)),
                notification: ReceptionNotification {
                    receiver_device_id: link.receiver.0,
                    transmitter_device_id: transmitter.0,
                    rx_power_dbm: link.budget.rx_power_dbm,
                    path_loss_db: link.budget.path_loss_db,
                    distance_m: link.budget.distance_m,
                    frequency_hz: endpoint.frequency_hz,
                    propagation_delay_nanos: link.budget.delay_nanos(),
                    tx_timestamp_nanos: now,
                    frame_size_bytes: frame.size_bytes(),
                    duration_nanos: duration_to_nanos(frame.duration),
                    payload: echo.clone(),
                },
            };
            self.deliver(reception);
        }
    }

    fn set_loss_model(&mut self, model: &LossModelSpec) {
        self.counters.record_config_sent();
        self.engine.set_loss_model(model.build());
    }

    fn set_delay_model(&mut self, model: &DelayModelSpec) {
        self.counters.record_config_sent();
        self.engine.set_delay_model(model.build());
    }

    fn remove_endpoint(&mut self, endpoint: &EndpointDescriptor) {
        match self.device_id(endpoint.endpoint_id) {
            Some(id) => {
                self.registry.unregister(id);
            }
            None => warn!(endpoint = %endpoint.endpoint_id, "Remove for unknown endpoint"),
        }
    }

    fn update_position(&mut self, endpoint: &mut EndpointDescriptor, position: Position) {
        endpoint.position = position;
        match self.device_id(endpoint.endpoint_id) {
            Some(id) => {
                self.registry.update_position(id, position, self.ctx.now_nanos());
            }
            None => warn!(endpoint = %endpoint.endpoint_id, "Position update for unknown endpoint"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{CollectingSink, StaticEndpoint};
    use crate::propagation::{free_space_path_loss_db, FixedDelay, RangeLoss};
    use crate::testing::ManualContext;
    use airwave_env::Rank;
    use approx::assert_relative_eq;

    const WIFI: u32 = 2_400_000_000;

    fn channel() -> (LocalChannel<ManualContext>, Arc<ManualContext>, Arc<CollectingSink>) {
        let ctx = Arc::new(ManualContext::new(Rank(0)));
        let sink = Arc::new(CollectingSink::new());
        let channel = LocalChannel::new(ctx.clone(), ProcessorConfig::default(), sink.clone());
        (channel, ctx, sink)
    }

    fn at(x: f64) -> StaticEndpoint {
        StaticEndpoint::new(Position::new(x, 0.0, 0.0), WIFI)
    }

    #[test]
    fn test_local_two_devices() {
        let (mut channel, ctx, sink) = channel();
        let a = channel.add_endpoint(&at(0.0));
        let b = channel.add_endpoint(&at(100.0));

        channel.transmit(&a, &Frame::new(&b"hi"[..]), 20.0);
        assert!(sink.is_empty());
        ctx.advance_to(333);

        let received = sink.receptions();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].endpoint_id, b.endpoint_id);
        assert_eq!(received[0].transmitter(), channel.device_id(a.endpoint_id).unwrap());
        assert_eq!(received[0].notification.frame_size_bytes, 2);
        assert_eq!(received[0].notification.duration(), None);
        assert_relative_eq!(
            received[0].notification.rx_power_dbm,
            20.0 - free_space_path_loss_db(100.0, WIFI as f64),
            epsilon = 1e-9
        );
        assert_eq!(channel.counters().receptions_delivered(), 1);
    }

    #[test]
    fn test_local_out_of_range() {
        let (mut channel, ctx, sink) = channel();
        let a = channel.add_endpoint(&at(0.0));
        channel.add_endpoint(&at(100_000.0));

        assert!(channel.preview(&a, 20.0).receivers.is_empty());
        channel.transmit(&a, &Frame::default(), 20.0);
        ctx.advance_to(u64::MAX);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_local_model_swap_and_move() {
        let (mut channel, ctx, sink) = channel();
        let a = channel.add_endpoint(&at(0.0));
        let mut b = channel.add_endpoint(&at(10.0));

        channel.set_loss_model(&LossModelSpec::Range(RangeLoss { max_range_m: 50.0 }));
        channel.set_delay_model(&DelayModelSpec::Fixed(FixedDelay { delay_nanos: 0 }));
        channel.transmit(&a, &Frame::default(), 0.0);
        assert_eq!(sink.len(), 1);

        channel.update_position(&mut b, Position::new(60.0, 0.0, 0.0));
        channel.transmit(&a, &Frame::default(), 0.0);
        ctx.advance_to(1_000);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_local_remove_endpoint() {
        let (mut channel, _, _) = channel();
        let a = channel.add_endpoint(&at(0.0));
        channel.remove_endpoint(&a);

        assert!(channel.device_id(a.endpoint_id).is_none());
        assert!(channel.registry().is_empty());
    }
}
