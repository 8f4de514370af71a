//! Device-Side Stub
//! ================
//!
//! Stands in for the channel on a device rank. Every operation that would
//! run propagation locally becomes a message to the channel rank instead:
//!
//! ```text
//! add_endpoint     -> DEVICE_REGISTER
//! transmit         -> TX_REQUEST
//! set_*_model      -> CONFIG_LOSS_MODEL / CONFIG_DELAY_MODEL
//! remove_endpoint  -> DEVICE_UNREGISTER
//! update_position  -> POSITION_UPDATE
//! heartbeat        -> HEARTBEAT
//! ```
//!
//! All sends are fire-and-forget. A send the transport refuses is logged and
//! counted, never retried and never replaced by a local computation.
//!
//! On the way back the stub accepts `REGISTER_ACK`, `RX_NOTIFICATION` and
//! `ERROR_RESPONSE` from the channel rank. Receptions are handed to the
//! [`ReceptionSink`] at `txTimestamp + propagationDelay`.

use crate::config::{PayloadMode, StubConfig};
use crate::dispatcher::MessageDispatcher;
use crate::endpoint::{
    ChannelTransport, EndpointDescriptor, Frame, Reception, ReceptionSink, WirelessEndpoint,
};
use crate::message::{
    duration_to_nanos, DeviceRegistration, DeviceUnregistration, Envelope, Header, Message,
    MessageKind, Payload, PositionUpdate, ReceptionNotification, SequenceCounter,
    TransmissionRequest,
};
use crate::metrics::StubCounters;
use crate::propagation::{dbm_to_watts, DelayModelSpec, LossModelSpec};
use crate::types::{DeviceId, EndpointId, Position};
use crate::validation::check_header;
use airwave_env::{ChannelContext, NetworkTransport, Rank};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Kinds a stub listens for.
pub const STUB_INBOUND_KINDS: [MessageKind; 3] = [
    MessageKind::RegisterAck,
    MessageKind::RxNotification,
    MessageKind::ErrorResponse,
];

/// Distributed implementation of [`ChannelTransport`].
///
/// Generic over the context and transport so the same stub runs under the
/// Tokio runtime and the deterministic simulator.
pub struct RemoteChannelStub<Ctx: ChannelContext, Net: NetworkTransport> {
    ctx: Arc<Ctx>,
    net: Arc<Net>,
    config: StubConfig,
    sequence: SequenceCounter,
    counters: Arc<StubCounters>,
    next_endpoint: u32,
    /// Global ids learned from REGISTER_ACK
    device_ids: HashMap<EndpointId, DeviceId>,
    sink: Arc<dyn ReceptionSink>,
}

impl<Ctx: ChannelContext, Net: NetworkTransport> RemoteChannelStub<Ctx, Net> {
    pub fn new(ctx: Arc<Ctx>, net: Arc<Net>, config: StubConfig, sink: Arc<dyn ReceptionSink>) -> Self {
        Self {
            ctx,
            net,
            config,
            sequence: SequenceCounter::new(),
            counters: Arc::new(StubCounters::new()),
            next_endpoint: 0,
            device_ids: HashMap::new(),
            sink,
        }
    }

    /// Wraps the stub for sharing and registers its inbound handlers.
    pub fn attach(self, dispatcher: &mut MessageDispatcher) -> Arc<Mutex<Self>> {
        let stub = Arc::new(Mutex::new(self));
        for kind in STUB_INBOUND_KINDS {
            let stub = stub.clone();
            dispatcher.on_message(kind, move |bytes, source| {
                stub.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .handle_message(bytes, source);
            });
        }
        stub
    }

    pub fn config(&self) -> &StubConfig {
        &self.config
    }

    pub fn counters(&self) -> Arc<StubCounters> {
        self.counters.clone()
    }

    /// Sequence number of the last message the transport accepted.
    pub fn last_message_id(&self) -> u32 {
        self.counters.last_message_id()
    }

    /// Global id of a local endpoint, once the channel has acknowledged it.
    pub fn device_id(&self, endpoint: EndpointId) -> Option<DeviceId> {
        self.device_ids.get(&endpoint).copied()
    }

    pub fn rank(&self) -> Rank {
        self.ctx.rank()
    }

    /// Tells the channel this rank is alive.
    pub fn heartbeat(&mut self) -> bool {
        self.send(Payload::Heartbeat, 0)
    }

    fn send(&mut self, payload: Payload, correlation_id: u32) -> bool {
        let kind = payload.kind();
        let target = self.config.channel_rank;
        let sequence_number = self.sequence.next();
        let envelope = Envelope {
            source_rank: self.ctx.rank(),
            target_rank: target,
            timestamp_nanos: self.ctx.now_nanos(),
            sequence_number,
            correlation_id,
        };

        let bytes = match Message::new(envelope, payload) {
            Ok(message) => message.serialize(),
            Err(e) => {
                warn!(%kind, seq = sequence_number, error = %e, "Cannot encode message");
                self.counters.record_send_failure();
                return false;
            }
        };

        let len = bytes.len();
        match self.net.send(target, bytes) {
            Ok(()) => {
                trace!(%kind, seq = sequence_number, len, %target, "Sent");
                self.counters.record_sent(sequence_number, len);
                true
            }
            Err(e) => {
                warn!(%kind, seq = sequence_number, %target, error = %e, "Send to channel failed, not retrying");
                self.counters.record_send_failure();
                false
            }
        }
    }

    /// Handles one inbound buffer from the transport. Never fails; bad
    /// input is logged and dropped.
    pub fn handle_message(&mut self, bytes: &[u8], source: Rank) {
        if source != self.config.channel_rank {
            warn!(%source, "Ignoring message from non-channel rank");
            return;
        }

        let header = match Header::peek(bytes) {
            Ok(header) => header,
            Err(e) => {
                warn!(%source, error = %e, "Dropping malformed message");
                return;
            }
        };
        if let Err(e) = check_header(&header, source, self.ctx.now_nanos(), &self.config.limits) {
            warn!(%source, seq = header.sequence_number, error = %e, "Rejected header");
            return;
        }

        let message = match Message::deserialize(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(%source, seq = header.sequence_number, error = %e, "Dropping malformed message");
                return;
            }
        };

        match message.into_payload() {
            Payload::RegisterAck(ack) => {
                let endpoint = EndpointId(ack.endpoint_id);
                let device_id = DeviceId(ack.device_id);
                debug!(%endpoint, %device_id, "Registration acknowledged");
                self.device_ids.insert(endpoint, device_id);
            }
            Payload::RxNotification(notification) => {
                self.deliver(EndpointId(header.correlation_id), notification);
            }
            Payload::ErrorResponse(response) => {
                warn!(
                    code = response.code.as_u32(),
                    related_seq = response.related_sequence,
                    "Channel rejected request: {}",
                    response.message
                );
                self.counters.record_error_received();
            }
            other => {
                warn!(kind = %other.kind(), "Unexpected message on device rank");
            }
        }
    }

    /// Hands a reception to the sink when the signal arrives.
    fn deliver(&self, endpoint_id: EndpointId, notification: ReceptionNotification) {
        let arrival = notification.arrival_nanos();
        let reception = Reception {
            endpoint_id,
            notification,
        };

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

    fn send_config(&mut self, payload: Payload) {
        self.counters.record_config_sent();
        self.send(payload, 0);
    }
}

impl<Ctx: ChannelContext, Net: NetworkTransport> ChannelTransport for RemoteChannelStub<Ctx, Net> {
    fn add_endpoint(&mut self, endpoint: &dyn WirelessEndpoint) -> EndpointDescriptor {
        self.counters.record_endpoint_added();
        self.next_endpoint += 1;
        let descriptor = EndpointDescriptor::from_endpoint(EndpointId(self.next_endpoint), endpoint);

        let payload = Payload::DeviceRegister(DeviceRegistration {
            device_id: descriptor.endpoint_id.0,
            position: descriptor.position,
            antenna_gain_db: descriptor.parameters.antenna_gain_db,
            frequency_hz: descriptor.frequency_hz,
        });
        debug!(endpoint = %descriptor.endpoint_id, rank = %self.ctx.rank(), "Registering endpoint with channel");
        self.send(payload, descriptor.endpoint_id.0);
        descriptor
    }

    fn transmit(&mut self, endpoint: &EndpointDescriptor, frame: &Frame, tx_power_dbm: f64) {
        self.counters.record_frame_sent();

        let payload = match self.config.payload_mode {
            PayloadMode::Full => frame.bytes.clone(),
            PayloadMode::SizeOnly => Bytes::new(),
        };
        let request = TransmissionRequest {
            device_id: endpoint.endpoint_id.0,
            tx_power_watts: dbm_to_watts(tx_power_dbm),
            frequency_hz: endpoint.frequency_hz,
            frame_size_bytes: frame.size_bytes(),
            duration_nanos: duration_to_nanos(frame.duration),
            payload,
        };
        trace!(endpoint = %endpoint.endpoint_id, frame_len = frame.size(), tx_power_dbm, "Forwarding transmission");
        self.send(Payload::TxRequest(request), endpoint.endpoint_id.0);
    }

    fn set_loss_model(&mut self, model: &LossModelSpec) {
        match model.to_update() {
            Ok(update) => self.send_config(Payload::ConfigLossModel(update)),
            Err(e) => warn!(error = %e, "Cannot encode loss model"),
        }
    }

    fn set_delay_model(&mut self, model: &DelayModelSpec) {
        match model.to_update() {
            Ok(update) => self.send_config(Payload::ConfigDelayModel(update)),
            Err(e) => warn!(error = %e, "Cannot encode delay model"),
        }
    }

    fn remove_endpoint(&mut self, endpoint: &EndpointDescriptor) {
        self.device_ids.remove(&endpoint.endpoint_id);
        let payload = Payload::DeviceUnregister(DeviceUnregistration {
            device_id: endpoint.endpoint_id.0,
        });
        self.send(payload, endpoint.endpoint_id.0);
    }

    fn update_position(&mut self, endpoint: &mut EndpointDescriptor, position: Position) {
        endpoint.position = position;
        let payload = Payload::PositionUpdate(PositionUpdate {
            device_id: endpoint.endpoint_id.0,
            position,
        });
        self.send(payload, endpoint.endpoint_id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{CollectingSink, StaticEndpoint};
    use crate::message::{deserialize, ErrorCode, ErrorResponse, RegisterAck};
    use crate::propagation::RangeLoss;
    use crate::testing::{DownTransport, ManualContext};
    use airwave_env::LoggingTransport;

    type TestStub = RemoteChannelStub<ManualContext, LoggingTransport>;

    fn stub_with(config: StubConfig) -> (TestStub, Arc<ManualContext>, Arc<LoggingTransport>, Arc<CollectingSink>) {
        let ctx = Arc::new(ManualContext::new(Rank(2)));
        let net = Arc::new(LoggingTransport::new(Rank(2)));
        let sink = Arc::new(CollectingSink::new());
        let stub = RemoteChannelStub::new(ctx.clone(), net.clone(), config, sink.clone());
        (stub, ctx, net, sink)
    }

    fn stub() -> (TestStub, Arc<ManualContext>, Arc<LoggingTransport>, Arc<CollectingSink>) {
        stub_with(StubConfig::default())
    }

    fn endpoint(x: f64) -> StaticEndpoint {
        StaticEndpoint::new(Position::new(x, 0.0, 0.0), 2_400_000_000)
    }

    fn last_sent(net: &LoggingTransport) -> Message {
        let sent = net.sent();
        let (target, bytes) = sent.last().unwrap();
        assert_eq!(*target, Rank(0));
        deserialize(bytes).unwrap()
    }

    fn from_channel(payload: Payload, correlation_id: u32) -> Vec<u8> {
        let envelope = Envelope {
            source_rank: Rank(0),
            target_rank: Rank(2),
            timestamp_nanos: 0,
            sequence_number: 1,
            correlation_id,
        };
        Message::new(envelope, payload).unwrap().serialize().to_vec()
    }

    fn notification(delay: u64) -> ReceptionNotification {
        ReceptionNotification {
            receiver_device_id: 5,
            transmitter_device_id: 4,
            rx_power_dbm: -60.0,
            path_loss_db: 80.0,
            distance_m: 100.0,
            frequency_hz: 2_400_000_000,
            propagation_delay_nanos: delay,
            tx_timestamp_nanos: 1_000,
            frame_size_bytes: 0,
            duration_nanos: 0,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn test_add_endpoint_sends_registration() {
        let (mut stub, _, net, _) = stub();
        let a = stub.add_endpoint(&endpoint(0.0).with_gain(2.0));
        let b = stub.add_endpoint(&endpoint(10.0));

        assert_eq!(a.endpoint_id, EndpointId(1));
        assert_eq!(b.endpoint_id, EndpointId(2));
        assert_eq!(stub.counters().endpoints_added(), 2);

        let message = last_sent(&net);
        assert_eq!(message.header().correlation_id, 2);
        assert_eq!(message.header().source_rank, Rank(2));
        match message.payload() {
            Payload::DeviceRegister(r) => {
                assert_eq!(r.device_id, 2);
                assert_eq!(r.position.x, 10.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_transmit_full_payload() {
        let (mut stub, _, net, sink) = stub();
        let a = stub.add_endpoint(&endpoint(0.0));
        stub.transmit(&a, &Frame::new(&b"hello"[..]), 20.0);

        let message = last_sent(&net);
        match message.payload() {
            Payload::TxRequest(t) => {
                assert_eq!(t.device_id, 1);
                assert!((t.tx_power_watts - 0.1).abs() < 1e-12);
                assert_eq!(&t.payload[..], b"hello");
            }
            other => panic!("unexpected payload {:?}", other),
        }
        // Nothing computed locally.
        assert!(sink.is_empty());
        assert_eq!(stub.counters().frames_sent(), 1);
        assert_eq!(stub.last_message_id(), 2);
    }

    #[test]
    fn test_transmit_size_only() {
        let (mut stub, _, net, _) = stub_with(StubConfig {
            payload_mode: PayloadMode::SizeOnly,
            ..Default::default()
        });
        let a = stub.add_endpoint(&endpoint(0.0));
        let frame = Frame::new(vec![0u8; 1500]).with_duration(Duration::from_micros(248));
        stub.transmit(&a, &frame, 20.0);

        match last_sent(&net).payload() {
            Payload::TxRequest(t) => {
                assert!(t.payload.is_empty());
                assert_eq!(t.payload_size_bytes(), 1500);
                assert_eq!(t.duration(), Some(Duration::from_micros(248)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_send_failure_is_counted_not_raised() {
        let ctx = Arc::new(ManualContext::new(Rank(2)));
        let sink = Arc::new(CollectingSink::new());
        let mut stub = RemoteChannelStub::new(ctx, Arc::new(DownTransport(Rank(2))), StubConfig::default(), sink.clone());

        let a = stub.add_endpoint(&endpoint(0.0));
        stub.transmit(&a, &Frame::new(&b"x"[..]), 10.0);

        let counters = stub.counters();
        assert_eq!(counters.send_failures(), 2);
        assert_eq!(counters.frames_sent(), 1);
        assert_eq!(counters.last_message_id(), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_model_configuration_messages() {
        let (mut stub, _, net, _) = stub();
        stub.set_loss_model(&LossModelSpec::Range(RangeLoss { max_range_m: 50.0 }));

        let message = last_sent(&net);
        assert_eq!(message.kind(), MessageKind::ConfigLossModel);
        match message.payload() {
            Payload::ConfigLossModel(update) => {
                let spec = LossModelSpec::decode(update.model_kind, &update.params).unwrap();
                assert_eq!(spec, LossModelSpec::Range(RangeLoss { max_range_m: 50.0 }));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        stub.set_delay_model(&DelayModelSpec::Fixed(crate::propagation::FixedDelay { delay_nanos: 10 }));
        assert_eq!(last_sent(&net).kind(), MessageKind::ConfigDelayModel);
        assert_eq!(stub.counters().configs_sent(), 2);
    }

    #[test]
    fn test_remove_and_move_endpoint() {
        let (mut stub, _, net, _) = stub();
        let mut a = stub.add_endpoint(&endpoint(0.0));

        stub.update_position(&mut a, Position::new(3.0, 4.0, 0.0));
        assert_eq!(a.position, Position::new(3.0, 4.0, 0.0));
        assert_eq!(last_sent(&net).kind(), MessageKind::PositionUpdate);

        stub.remove_endpoint(&a);
        match last_sent(&net).payload() {
            Payload::DeviceUnregister(u) => assert_eq!(u.device_id, 1),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat() {
        let (mut stub, _, net, _) = stub();
        assert!(stub.heartbeat());
        assert_eq!(last_sent(&net).kind(), MessageKind::Heartbeat);
    }

    #[test]
    fn test_register_ack_records_device_id() {
        let (mut stub, _, _, _) = stub();
        let a = stub.add_endpoint(&endpoint(0.0));
        assert_eq!(stub.device_id(a.endpoint_id), None);

        let ack = from_channel(Payload::RegisterAck(RegisterAck { endpoint_id: 1, device_id: 17 }), 1);
        stub.handle_message(&ack, Rank(0));
        assert_eq!(stub.device_id(a.endpoint_id), Some(DeviceId(17)));
    }

    #[test]
    fn test_reception_scheduled_at_arrival() {
        let (mut stub, ctx, _, sink) = stub();
        let bytes = from_channel(Payload::RxNotification(notification(333)), 1);

        stub.handle_message(&bytes, Rank(0));
        assert!(sink.is_empty());
        assert_eq!(ctx.pending(), 1);

        ctx.advance_to(1_332);
        assert!(sink.is_empty());
        ctx.advance_to(1_333);

        let received = sink.receptions();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].endpoint_id, EndpointId(1));
        assert_eq!(received[0].receiver(), DeviceId(5));
        assert_eq!(stub.counters().receptions_delivered(), 1);
    }

    #[test]
    fn test_late_reception_delivered_immediately() {
        let (mut stub, ctx, _, sink) = stub();
        ctx.advance_to(10_000);
        let bytes = from_channel(Payload::RxNotification(notification(333)), 3);

        stub.handle_message(&bytes, Rank(0));
        assert_eq!(sink.len(), 1);
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn test_error_response_counted() {
        let (mut stub, _, _, _) = stub();
        let bytes = from_channel(
            Payload::ErrorResponse(ErrorResponse {
                code: ErrorCode::UnregisteredSender,
                related_sequence: 4,
                message: "unknown sender".into(),
            }),
            0,
        );
        stub.handle_message(&bytes, Rank(0));
        assert_eq!(stub.counters().errors_received(), 1);
    }

    #[test]
    fn test_bad_inbound_is_dropped() {
        let (mut stub, _, _, sink) = stub();
        let bytes = from_channel(Payload::RxNotification(notification(0)), 1);

        // Wrong source rank.
        stub.handle_message(&bytes, Rank(3));
        // Truncated.
        stub.handle_message(&bytes[..20], Rank(0));
        // Header claims a different sender.
        let mut forged = bytes.clone();
        forged[8..12].copy_from_slice(&7u32.to_be_bytes());
        stub.handle_message(&forged, Rank(0));

        assert!(sink.is_empty());
    }

    #[test]
    fn test_attach_routes_through_dispatcher() {
        let (stub, ctx, _, sink) = stub();
        ctx.advance_to(5_000);
        let mut dispatcher = MessageDispatcher::new();
        let _stub = stub.attach(&mut dispatcher);

        let bytes = from_channel(Payload::RxNotification(notification(0)), 1);
        dispatcher.deliver(&bytes, Rank(0));
        assert_eq!(sink.len(), 1);
    }
}
