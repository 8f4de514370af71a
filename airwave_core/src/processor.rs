//! Channel-Side Processor
//! ======================
//!
//! The single authority for propagation. Runs on the channel rank, owns the
//! device registry and the propagation engine, and answers transmissions
//! with reception notifications.
//!
//! # State machine
//!
//! ```text
//! Uninitialized --initialize()--> Ready --start_processing()--> Processing
//!                                   ^                               |
//!                                   +-------stop_processing()-------+
//! ```
//!
//! Messages that arrive outside `Processing` are dropped with a warning.
//!
//! # Failure model
//!
//! `handle_message` never fails. Malformed input, unknown senders and bad
//! model parameters are logged, counted and dropped so that the channel,
//! which every device rank depends on, stays live.

use crate::config::ProcessorConfig;
use crate::dispatcher::MessageDispatcher;
use crate::error::{ProcessorError, ProtocolError};
use crate::message::{
    DeviceRegistration, Envelope, ErrorCode, ErrorResponse, Header, Message, MessageKind, Payload,
    ReceptionNotification, RegisterAck, SequenceCounter, TransmissionRequest,
};
use crate::metrics::ProcessorStats;
use crate::propagation::{watts_to_dbm, Antenna, LinkBudget, PropagationEngine};
use crate::registry::{DeviceRegistry, NewDevice};
use crate::types::{DeviceId, EndpointId};
use crate::validation::check_header;
use airwave_env::{ChannelContext, NetworkTransport, Rank};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// Kinds a channel processor listens for.
pub const CHANNEL_INBOUND_KINDS: [MessageKind; 7] = [
    MessageKind::DeviceRegister,
    MessageKind::DeviceUnregister,
    MessageKind::ConfigLossModel,
    MessageKind::ConfigDelayModel,
    MessageKind::TxRequest,
    MessageKind::Heartbeat,
    MessageKind::PositionUpdate,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Uninitialized,
    Ready,
    Processing,
}

/// Called after each registration with `(device_id, owner_rank, endpoint)`.
pub type RegistrationCallback = Box<dyn FnMut(DeviceId, Rank, EndpointId) + Send>;

/// Called after each transmission with the transmitter and the
/// notifications it produced.
pub type TransmissionCallback = Box<dyn FnMut(DeviceId, &[ReceptionNotification]) + Send>;

// =============================================================================
// FAN-OUT
// =============================================================================

/// One receiver that passed the reception threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverLink {
    pub receiver: DeviceId,
    pub owner_rank: Rank,
    pub endpoint_id: Option<EndpointId>,
    pub budget: LinkBudget,
}

/// Result of evaluating one transmission against the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanOut {
    /// Receivers at or above threshold, in ascending device id order
    pub receivers: Vec<ReceiverLink>,
    /// Candidates that were evaluated but fell below threshold
    pub below_threshold: u64,
}

/// Evaluates a transmission from `transmitter` against every other active
/// device tuned to `frequency_hz`.
///
/// O(registered devices). Unknown transmitters produce an empty fan-out.
pub fn evaluate_transmission(
    registry: &DeviceRegistry,
    engine: &PropagationEngine,
    transmitter: DeviceId,
    tx_power_dbm: f64,
    frequency_hz: u32,
    threshold_dbm: f64,
) -> FanOut {
    let Some(tx) = registry.get(transmitter) else {
        return FanOut::default();
    };
    let tx_antenna = Antenna {
        position: tx.position,
        gain_db: tx.antenna_gain_db,
    };

    let mut fan_out = FanOut::default();
    for rx in registry
        .all_except(transmitter)
        .filter(|r| r.is_active && r.frequency_hz == frequency_hz)
    {
        let rx_antenna = Antenna {
            position: rx.position,
            gain_db: rx.antenna_gain_db,
        };
        let budget = engine.link_budget(&tx_antenna, &rx_antenna, tx_power_dbm, frequency_hz as f64);

        if budget.rx_power_dbm >= threshold_dbm {
            fan_out.receivers.push(ReceiverLink {
                receiver: rx.device_id,
                owner_rank: rx.owner_rank,
                endpoint_id: rx.endpoint_id,
                budget,
            });
        } else {
            trace!(receiver = %rx.device_id, rx_power_dbm = budget.rx_power_dbm, "Below threshold");
            fan_out.below_threshold += 1;
        }
    }
    fan_out
}

// =============================================================================
// PROCESSOR
// =============================================================================

pub struct ChannelProcessor<Ctx: ChannelContext, Net: NetworkTransport> {
    ctx: Arc<Ctx>,
    net: Arc<Net>,
    config: ProcessorConfig,
    state: ProcessorState,
    registry: DeviceRegistry,
    engine: PropagationEngine,
    sequence: SequenceCounter,
    stats: ProcessorStats,
    on_registration: Option<RegistrationCallback>,
    on_transmission: Option<TransmissionCallback>,
}

impl<Ctx: ChannelContext, Net: NetworkTransport> ChannelProcessor<Ctx, Net> {
    pub fn new(ctx: Arc<Ctx>, net: Arc<Net>, config: ProcessorConfig) -> Self {
        Self {
            ctx,
            net,
            config,
            state: ProcessorState::Uninitialized,
            registry: DeviceRegistry::new(),
            engine: PropagationEngine::default(),
            sequence: SequenceCounter::new(),
            stats: ProcessorStats::default(),
            on_registration: None,
            on_transmission: None,
        }
    }

    /// Replaces the default free-space / speed-of-light engine.
    pub fn with_engine(mut self, engine: PropagationEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Checks that this process is the designated channel rank.
    pub fn initialize(&mut self) -> Result<(), ProcessorError> {
        let actual = self.ctx.rank();
        if actual != self.config.channel_rank {
            return Err(ProcessorError::WrongRank {
                expected: self.config.channel_rank,
                actual,
            });
        }
        if self.state == ProcessorState::Uninitialized {
            self.state = ProcessorState::Ready;
        }
        info!(rank = %actual, threshold_dbm = self.config.reception_threshold_dbm, "Channel processor ready");
        Ok(())
    }

    pub fn start_processing(&mut self) -> Result<(), ProcessorError> {
        match self.state {
            ProcessorState::Uninitialized => Err(ProcessorError::NotInitialized),
            ProcessorState::Ready | ProcessorState::Processing => {
                self.state = ProcessorState::Processing;
                Ok(())
            }
        }
    }

    pub fn stop_processing(&mut self) {
        if self.state == ProcessorState::Processing {
            self.state = ProcessorState::Ready;
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn is_processing(&self) -> bool {
        self.state == ProcessorState::Processing
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &PropagationEngine {
        &self.engine
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }

    pub fn set_registration_callback<F>(&mut self, callback: F)
    where
        F: FnMut(DeviceId, Rank, EndpointId) + Send + 'static,
    {
        self.on_registration = Some(Box::new(callback));
    }

    pub fn set_transmission_callback<F>(&mut self, callback: F)
    where
        F: FnMut(DeviceId, &[ReceptionNotification]) + Send + 'static,
    {
        self.on_transmission = Some(Box::new(callback));
    }

    /// Wraps the processor for sharing and registers its inbound handlers.
    pub fn attach(self, dispatcher: &mut MessageDispatcher) -> Arc<Mutex<Self>> {
        let processor = Arc::new(Mutex::new(self));
        for kind in CHANNEL_INBOUND_KINDS {
            let processor = processor.clone();
            dispatcher.on_message(kind, move |bytes, source| {
                processor
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .handle_message(bytes, source);
            });
        }
        processor
    }

    /// Handles one inbound buffer reported by the transport as coming from
    /// `source`.
    pub fn handle_message(&mut self, bytes: &[u8], source: Rank) {
        self.stats.messages_received += 1;

        if self.state != ProcessorState::Processing {
            self.stats.dropped_not_processing += 1;
            warn!(%source, state = ?self.state, "Dropping message, processor not running");
            return;
        }

        let header = match Header::peek(bytes) {
            Ok(header) => header,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(%source, error = %e, "Dropping malformed message");
                return;
            }
        };

        let now = self.ctx.now_nanos();
        if let Err(e) = check_header(&header, source, now, &self.config.limits()) {
            self.stats.malformed += 1;
            warn!(%source, seq = header.sequence_number, error = %e, "Rejected header");
            return;
        }

        let message = match Message::deserialize(bytes) {
            Ok(message) => message,
            Err(ProtocolError::UnknownKind(kind)) => {
                self.stats.unknown_kinds += 1;
                warn!(%source, kind, "Ignoring unknown message kind");
                return;
            }
            Err(e) => {
                self.stats.malformed += 1;
                warn!(%source, seq = header.sequence_number, error = %e, "Dropping malformed message");
                return;
            }
        };

        trace!(%source, kind = %message.kind(), seq = header.sequence_number, "Processing");
        if let Err(e) = self.dispatch(&header, message.into_payload(), source) {
            self.reject(&header, source, e);
        }
    }

    fn dispatch(&mut self, header: &Header, payload: Payload, source: Rank) -> Result<(), ProcessorError> {
        let now = self.ctx.now_nanos();
        match payload {
            Payload::DeviceRegister(registration) => {
                self.register(source, registration, now);
                Ok(())
            }
            Payload::DeviceUnregister(request) => {
                let id = self.resolve_target(source, request.device_id)?;
                self.registry.unregister(id);
                self.stats.unregistrations += 1;
                Ok(())
            }
            Payload::PositionUpdate(update) => {
                let id = self.resolve_target(source, update.device_id)?;
                self.registry.update_position(id, update.position, now);
                self.stats.position_updates += 1;
                Ok(())
            }
            Payload::ConfigLossModel(update) | Payload::ConfigDelayModel(update) => {
                let kind = header.message_kind()?;
                match self.engine.apply_update(kind, &update) {
                    Ok(model) => {
                        self.stats.config_updates += 1;
                        info!(%source, %kind, model, "Propagation model replaced");
                        Ok(())
                    }
                    Err(e) => {
                        self.stats.rejected_configs += 1;
                        Err(e.into())
                    }
                }
            }
            Payload::TxRequest(request) => self.process_transmission(header, source, request),
            Payload::Heartbeat => {
                self.stats.heartbeats += 1;
                let touched = self.registry.touch_rank(source, now);
                trace!(%source, touched, "Heartbeat");
                Ok(())
            }
            other => {
                warn!(%source, kind = %other.kind(), "Unexpected message on channel rank");
                Ok(())
            }
        }
    }

    fn resolve_target(&mut self, source: Rank, endpoint: u32) -> Result<DeviceId, ProcessorError> {
        let endpoint = EndpointId(endpoint);
        self.registry.resolve(source, endpoint).ok_or_else(|| {
            self.stats.unregistered_targets += 1;
            ProcessorError::UnregisteredTarget { rank: source, endpoint }
        })
    }

    fn register(&mut self, source: Rank, registration: DeviceRegistration, now: u64) {
        let endpoint = EndpointId(registration.device_id);
        let outcome = self.registry.register_endpoint(NewDevice {
            owner_rank: source,
            endpoint_id: endpoint,
            position: registration.position,
            antenna_gain_db: registration.antenna_gain_db,
            frequency_hz: registration.frequency_hz,
            now_nanos: now,
        });
        self.stats.registrations += 1;
        info!(
            device_id = %outcome.device_id,
            rank = %source,
            %endpoint,
            created = outcome.created,
            devices = self.registry.len(),
            "Device registered"
        );

        let ack = Payload::RegisterAck(RegisterAck {
            endpoint_id: endpoint.0,
            device_id: outcome.device_id.0,
        });
        self.send_to(source, endpoint.0, ack);

        if let Some(callback) = self.on_registration.as_mut() {
            callback(outcome.device_id, source, endpoint);
        }
    }

    fn process_transmission(
        &mut self,
        header: &Header,
        source: Rank,
        request: TransmissionRequest,
    ) -> Result<(), ProcessorError> {
        let endpoint = EndpointId(request.device_id);
        let Some(transmitter) = self.registry.resolve(source, endpoint) else {
            self.stats.unregistered_senders += 1;
            return Err(ProcessorError::UnregisteredSender { rank: source, endpoint });
        };

        self.stats.transmissions += 1;
        self.registry.touch(transmitter, self.ctx.now_nanos());

        let tx_power_dbm = watts_to_dbm(request.tx_power_watts);
        let fan_out = evaluate_transmission(
            &self.registry,
            &self.engine,
            transmitter,
            tx_power_dbm,
            request.frequency_hz,
            self.config.reception_threshold_dbm,
        );
        self.stats.below_threshold += fan_out.below_threshold;

        let echo = if self.config.echo_payload {
            request.payload.clone()
        } else {
            Bytes::new()
        };

        let mut notifications = Vec::with_capacity(fan_out.receivers.len());
        for link in &fan_out.receivers {
            let notification = ReceptionNotification {
                receiver_device_id: link.receiver.0,
                transmitter_device_id: transmitter.0,
                rx_power_dbm: link.budget.rx_power_dbm,
                path_loss_db: link.budget.path_loss_db,
                distance_m: link.budget.distance_m,
                frequency_hz: request.frequency_hz,
                propagation_delay_nanos: link.budget.delay_nanos(),
                tx_timestamp_nanos: header.timestamp_nanos,
                frame_size_bytes: request.frame_size_bytes,
                duration_nanos: request.duration_nanos,
                payload: echo.clone(),
            };
            let correlation_id = link.endpoint_id.map(|e| e.0).unwrap_or(0);
            if self.send_to(
                link.owner_rank,
                correlation_id,
                Payload::RxNotification(notification.clone()),
            ) {
                self.stats.notifications_sent += 1;
            }
            notifications.push(notification);
        }

        debug!(
            %transmitter,
            tx_power_dbm,
            receivers = notifications.len(),
            below_threshold = fan_out.below_threshold,
            "Transmission processed"
        );

        if let Some(callback) = self.on_transmission.as_mut() {
            callback(transmitter, &notifications);
        }
        Ok(())
    }

    fn reject(&mut self, header: &Header, source: Rank, error: ProcessorError) {
        warn!(%source, seq = header.sequence_number, error = %error, "Request rejected");
        if !self.config.error_responses {
            return;
        }

        let code = match &error {
            ProcessorError::UnregisteredSender { .. } => ErrorCode::UnregisteredSender,
            ProcessorError::UnregisteredTarget { .. } => ErrorCode::UnregisteredTarget,
            ProcessorError::Model(_) => ErrorCode::InvalidModel,
            ProcessorError::Protocol(_) => ErrorCode::Malformed,
            _ => ErrorCode::Other(0),
        };
        let response = Payload::ErrorResponse(ErrorResponse {
            code,
            related_sequence: header.sequence_number,
            message: error.to_string(),
        });
        self.send_to(source, header.correlation_id, response);
    }

    fn send_to(&mut self, target: Rank, correlation_id: u32, payload: Payload) -> bool {
        let kind = payload.kind();
        let envelope = Envelope {
            source_rank: self.ctx.rank(),
            target_rank: target,
            timestamp_nanos: self.ctx.now_nanos(),
            sequence_number: self.sequence.next(),
            correlation_id,
        };

        let result = Message::new(envelope, payload)
            .map_err(ProcessorError::from)
            .and_then(|message| {
                self.net
                    .send(target, message.serialize())
                    .map_err(ProcessorError::from)
            });

        match result {
            Ok(()) => true,
            Err(e) => {
                self.stats.send_failures += 1;
                warn!(%target, %kind, seq = envelope.sequence_number, error = %e, "Send failed, not retrying");
                false
            }
        }
    }

    /// Drops every device owned by a rank that has left the run.
    pub fn disconnect_rank(&mut self, rank: Rank) -> Vec<DeviceId> {
        let removed = self.registry.unregister_rank(rank);
        self.stats.unregistrations += removed.len() as u64;
        if !removed.is_empty() {
            info!(%rank, devices = removed.len(), "Rank disconnected");
        }
        removed
    }

    /// Applies the inactivity timeout, if one is configured.
    pub fn sweep_inactive(&mut self) -> Vec<DeviceId> {
        let Some(timeout) = self.config.inactivity_timeout_nanos else {
            return Vec::new();
        };
        let expired = self.registry.expire_inactive(self.ctx.now_nanos(), timeout);
        self.stats.expired_devices += expired.len() as u64;
        if !expired.is_empty() {
            info!(devices = expired.len(), "Expired inactive devices");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{deserialize, DeviceUnregistration, PositionUpdate};
    use crate::propagation::{free_space_path_loss_db, LossModelSpec, RangeLoss};
    use crate::testing::{DownTransport, ManualContext};
    use crate::types::Position;
    use std::time::Duration;
    use airwave_env::LoggingTransport;
    use approx::assert_relative_eq;

    const WIFI: u32 = 2_400_000_000;

    type TestProcessor = ChannelProcessor<ManualContext, LoggingTransport>;

    struct Harness {
        processor: TestProcessor,
        ctx: Arc<ManualContext>,
        net: Arc<LoggingTransport>,
        seq: u32,
    }

    impl Harness {
        fn new(config: ProcessorConfig) -> Self {
            let ctx = Arc::new(ManualContext::new(Rank(0)));
            let net = Arc::new(LoggingTransport::new(Rank(0)));
            let mut processor = ChannelProcessor::new(ctx.clone(), net.clone(), config);
            processor.initialize().unwrap();
            processor.start_processing().unwrap();
            Self { processor, ctx, net, seq: 0 }
        }

        fn send(&mut self, from: u32, correlation_id: u32, payload: Payload) {
            self.seq += 1;
            let envelope = Envelope {
                source_rank: Rank(from),
                target_rank: Rank(0),
                timestamp_nanos: self.ctx.now_nanos(),
                sequence_number: self.seq,
                correlation_id,
            };
            let bytes = Message::new(envelope, payload).unwrap().serialize();
            self.processor.handle_message(&bytes, Rank(from));
        }

        fn register(&mut self, rank: u32, endpoint: u32, x: f64) {
            self.register_on(rank, endpoint, x, WIFI);
        }

        fn register_on(&mut self, rank: u32, endpoint: u32, x: f64, frequency_hz: u32) {
            let payload = Payload::DeviceRegister(DeviceRegistration {
                device_id: endpoint,
                position: Position::new(x, 0.0, 0.0),
                antenna_gain_db: 0.0,
                frequency_hz,
            });
            self.send(rank, endpoint, payload);
        }

        fn transmit(&mut self, rank: u32, endpoint: u32, tx_power_dbm: f64) {
            let payload = Payload::TxRequest(TransmissionRequest {
                device_id: endpoint,
                tx_power_watts: crate::propagation::dbm_to_watts(tx_power_dbm),
                frequency_hz: WIFI,
                frame_size_bytes: 5,
                duration_nanos: 0,
                payload: Bytes::from_static(b"frame"),
            });
            self.send(rank, endpoint, payload);
        }

        fn outbound(&self) -> Vec<(Rank, Message)> {
            self.net
                .sent()
                .into_iter()
                .map(|(rank, bytes)| (rank, deserialize(&bytes).unwrap()))
                .collect()
        }

        fn notifications(&self) -> Vec<(Rank, u32, ReceptionNotification)> {
            self.outbound()
                .into_iter()
                .filter_map(|(rank, m)| {
                    let correlation = m.header().correlation_id;
                    match m.into_payload() {
                        Payload::RxNotification(n) => Some((rank, correlation, n)),
                        _ => None,
                    }
                })
                .collect()
        }

        fn id_of(&self, rank: u32, endpoint: u32) -> DeviceId {
            self.processor.registry().resolve(Rank(rank), EndpointId(endpoint)).unwrap()
        }
    }

    fn harness() -> Harness {
        Harness::new(ProcessorConfig::default())
    }

    #[test]
    fn test_initialize_on_wrong_rank() {
        let ctx = Arc::new(ManualContext::new(Rank(3)));
        let net = Arc::new(LoggingTransport::new(Rank(3)));
        let mut processor = ChannelProcessor::new(ctx, net, ProcessorConfig::default());

        assert!(matches!(
            processor.initialize(),
            Err(ProcessorError::WrongRank { expected: Rank(0), actual: Rank(3) })
        ));
        assert_eq!(processor.state(), ProcessorState::Uninitialized);
        assert!(matches!(processor.start_processing(), Err(ProcessorError::NotInitialized)));
    }

    #[test]
    fn test_messages_dropped_unless_processing() {
        let mut h = harness();
        h.processor.stop_processing();
        assert_eq!(h.processor.state(), ProcessorState::Ready);

        h.register(1, 1, 0.0);
        assert!(h.processor.registry().is_empty());
        assert_eq!(h.processor.stats().dropped_not_processing, 1);

        h.processor.start_processing().unwrap();
        h.register(1, 1, 0.0);
        assert_eq!(h.processor.registry().len(), 1);
    }

    #[test]
    fn test_registration_acknowledged() {
        let mut h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook = seen.clone();
        h.processor
            .set_registration_callback(move |id, rank, endpoint| hook.lock().unwrap().push((id, rank, endpoint)));

        h.register(2, 5, 0.0);

        let outbound = h.outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].0, Rank(2));
        assert_eq!(
            outbound[0].1.payload(),
            &Payload::RegisterAck(RegisterAck { endpoint_id: 5, device_id: 1 })
        );
        assert_eq!(*seen.lock().unwrap(), vec![(DeviceId(1), Rank(2), EndpointId(5))]);
        assert_eq!(h.processor.stats().registrations, 1);
    }

    #[test]
    fn test_two_devices_100m() {
        let mut h = harness();
        h.register(1, 1, 0.0);
        h.register(2, 1, 100.0);
        h.transmit(1, 1, 20.0);

        let notifications = h.notifications();
        assert_eq!(notifications.len(), 1);
        let (rank, correlation, n) = &notifications[0];

        let expected_loss = free_space_path_loss_db(100.0, WIFI as f64);
        assert_eq!(*rank, Rank(2));
        assert_eq!(*correlation, 1);
        assert_eq!(n.receiver_device_id, h.id_of(2, 1).0);
        assert_eq!(n.transmitter_device_id, h.id_of(1, 1).0);
        assert_relative_eq!(n.distance_m, 100.0);
        assert_relative_eq!(n.path_loss_db, expected_loss, epsilon = 1e-9);
        assert_relative_eq!(n.rx_power_dbm, 20.0 - expected_loss, epsilon = 1e-6);
        assert_relative_eq!(n.rx_power_dbm, -60.05, epsilon = 0.01);
        assert_eq!(n.propagation_delay_nanos, 333);
        assert!(n.payload.is_empty());
    }

    #[test]
    fn test_two_devices_100km_out_of_range() {
        let mut h = harness();
        h.register(1, 1, 0.0);
        h.register(2, 1, 100_000.0);
        h.transmit(1, 1, 20.0);

        assert!(h.notifications().is_empty());
        let stats = h.processor.stats();
        assert_eq!(stats.transmissions, 1);
        assert_eq!(stats.below_threshold, 1);
    }

    #[test]
    fn test_threshold_boundary() {
        let exact = 20.0 - free_space_path_loss_db(100.0, WIFI as f64);

        let mut at = Harness::new(ProcessorConfig {
            reception_threshold_dbm: exact - 1e-9,
            ..Default::default()
        });
        at.register(1, 1, 0.0);
        at.register(2, 1, 100.0);
        at.transmit(1, 1, 20.0);
        assert_eq!(at.notifications().len(), 1);

        let mut above = Harness::new(ProcessorConfig {
            reception_threshold_dbm: exact + 0.01,
            ..Default::default()
        });
        above.register(1, 1, 0.0);
        above.register(2, 1, 100.0);
        above.transmit(1, 1, 20.0);
        assert!(above.notifications().is_empty());
    }

    #[test]
    fn test_self_exclusion_and_fan_out() {
        let mut h = harness();
        for endpoint in 1..=5 {
            h.register(1, endpoint, endpoint as f64 * 10.0);
        }
        h.transmit(1, 3, 20.0);

        let transmitter = h.id_of(1, 3).0;
        let notifications = h.notifications();
        assert_eq!(notifications.len(), 4);
        assert!(notifications.iter().all(|(_, _, n)| n.receiver_device_id != transmitter));

        // Ascending device id order.
        let receivers: Vec<u32> = notifications.iter().map(|(_, _, n)| n.receiver_device_id).collect();
        let mut sorted = receivers.clone();
        sorted.sort_unstable();
        assert_eq!(receivers, sorted);
    }

    #[test]
    fn test_frequency_mismatch_not_notified() {
        let mut h = harness();
        h.register(1, 1, 0.0);
        h.register_on(2, 1, 10.0, 900_000_000);
        h.register(2, 2, 10.0);
        h.transmit(1, 1, 20.0);

        let notifications = h.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].1, 2);
    }

    #[test]
    fn test_unregistered_sender() {
        let mut h = harness();
        h.register(2, 1, 10.0);
        h.transmit(1, 9, 20.0);

        assert!(h.notifications().is_empty());
        assert_eq!(h.processor.stats().unregistered_senders, 1);
        // Only the registration ack went out.
        assert_eq!(h.outbound().len(), 1);
    }

    #[test]
    fn test_unregistered_sender_error_response() {
        let mut h = Harness::new(ProcessorConfig {
            error_responses: true,
            ..Default::default()
        });
        h.transmit(1, 9, 20.0);

        let outbound = h.outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].0, Rank(1));
        match outbound[0].1.payload() {
            Payload::ErrorResponse(e) => {
                assert_eq!(e.code, ErrorCode::UnregisteredSender);
                assert_eq!(e.related_sequence, 1);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unregister_then_transmit() {
        let mut h = harness();
        h.register(1, 1, 0.0);
        h.register(2, 1, 10.0);
        let id = h.id_of(1, 1);

        h.send(1, 1, Payload::DeviceUnregister(DeviceUnregistration { device_id: 1 }));
        assert!(h.processor.registry().get(id).is_none());

        h.transmit(1, 1, 20.0);
        assert!(h.notifications().is_empty());
        assert_eq!(h.processor.stats().unregistered_senders, 1);

        // Unknown target is a warning only.
        h.send(1, 1, Payload::DeviceUnregister(DeviceUnregistration { device_id: 1 }));
        assert_eq!(h.processor.stats().unregistered_targets, 1);
    }

    #[test]
    fn test_model_swap_changes_results() {
        let mut h = harness();
        h.register(1, 1, 0.0);
        h.register(2, 1, 100_000.0);

        let update = LossModelSpec::Range(RangeLoss { max_range_m: 200_000.0 }).to_update().unwrap();
        h.send(1, 0, Payload::ConfigLossModel(update));
        assert_eq!(h.processor.engine().loss_model().name(), "range");

        h.transmit(1, 1, 20.0);
        let notifications = h.notifications();
        assert_eq!(notifications.len(), 1);
        assert_relative_eq!(notifications[0].2.rx_power_dbm, 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bad_model_rejected() {
        let mut h = harness();
        let mut update = LossModelSpec::FreeSpace.to_update().unwrap();
        update.model_kind = 77;
        h.send(1, 0, Payload::ConfigLossModel(update));

        assert_eq!(h.processor.stats().rejected_configs, 1);
        assert_eq!(h.processor.engine().loss_model().name(), "free-space");
    }

    #[test]
    fn test_position_update_moves_out_of_range() {
        let mut h = harness();
        h.register(1, 1, 0.0);
        h.register(2, 1, 100.0);
        h.send(
            2,
            1,
            Payload::PositionUpdate(PositionUpdate {
                device_id: 1,
                position: Position::new(100_000.0, 0.0, 0.0),
            }),
        );
        h.transmit(1, 1, 20.0);

        assert!(h.notifications().is_empty());
        assert_eq!(h.processor.stats().position_updates, 1);
    }

    #[test]
    fn test_malformed_and_unknown_input_survives() {
        let mut h = harness();
        h.processor.handle_message(&[1, 2, 3], Rank(1));

        let envelope = Envelope {
            source_rank: Rank(1),
            target_rank: Rank(0),
            timestamp_nanos: 0,
            sequence_number: 1,
            correlation_id: 0,
        };
        let mut unknown = Message::new(envelope, Payload::Heartbeat).unwrap().serialize().to_vec();
        unknown[0..4].copy_from_slice(&500u32.to_be_bytes());
        h.processor.handle_message(&unknown, Rank(1));

        // Header claims rank 1, transport says rank 2.
        let forged = Message::new(envelope, Payload::Heartbeat).unwrap().serialize();
        h.processor.handle_message(&forged, Rank(2));

        let stats = h.processor.stats();
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.unknown_kinds, 1);
        assert!(h.processor.is_processing());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let mut h = harness();
        let envelope = Envelope {
            source_rank: Rank(1),
            target_rank: Rank(0),
            timestamp_nanos: 5_000_000_000,
            sequence_number: 1,
            correlation_id: 1,
        };
        let bytes = Message::new(
            envelope,
            Payload::DeviceRegister(DeviceRegistration {
                device_id: 1,
                position: Position::zeros(),
                antenna_gain_db: 0.0,
                frequency_hz: WIFI,
            }),
        )
        .unwrap()
        .serialize();
        h.processor.handle_message(&bytes, Rank(1));

        assert!(h.processor.registry().is_empty());
        assert_eq!(h.processor.stats().malformed, 1);
    }

    #[test]
    fn test_echo_payload() {
        let mut h = Harness::new(ProcessorConfig {
            echo_payload: true,
            ..Default::default()
        });
        h.register(1, 1, 0.0);
        h.register(2, 1, 10.0);
        h.transmit(1, 1, 20.0);

        assert_eq!(&h.notifications()[0].2.payload[..], b"frame");
    }

    #[test]
    fn test_frame_size_reaches_receivers_without_payload() {
        let mut h = harness();
        h.register(1, 1, 0.0);
        h.register(2, 1, 10.0);
        h.send(
            1,
            1,
            Payload::TxRequest(TransmissionRequest {
                device_id: 1,
                tx_power_watts: 0.1,
                frequency_hz: WIFI,
                frame_size_bytes: 1500,
                duration_nanos: 248_000,
                payload: Bytes::new(),
            }),
        );

        let (_, _, n) = &h.notifications()[0];
        assert_eq!(n.frame_size_bytes, 1500);
        assert_eq!(n.duration(), Some(Duration::from_micros(248)));
        assert!(n.payload.is_empty());
    }

    #[test]
    fn test_transmission_callback() {
        let mut h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook = seen.clone();
        h.processor.set_transmission_callback(move |tx, receptions| {
            hook.lock().unwrap().push((tx, receptions.len()));
        });
        h.register(1, 1, 0.0);
        h.register(1, 2, 10.0);
        h.register(2, 1, 20.0);
        h.transmit(1, 1, 20.0);

        assert_eq!(*seen.lock().unwrap(), vec![(h.id_of(1, 1), 2)]);
    }

    #[test]
    fn test_heartbeat_and_inactivity_sweep() {
        let mut h = Harness::new(ProcessorConfig {
            inactivity_timeout_nanos: Some(1_000),
            ..Default::default()
        });
        h.register(1, 1, 0.0);
        h.register(2, 1, 10.0);

        h.ctx.advance_to(900);
        h.send(2, 0, Payload::Heartbeat);
        h.ctx.advance_to(1_500);

        let expired = h.processor.sweep_inactive();
        assert_eq!(expired.len(), 1);
        assert!(h.processor.registry().resolve(Rank(1), EndpointId(1)).is_none());
        assert!(h.processor.registry().resolve(Rank(2), EndpointId(1)).is_some());
        assert_eq!(h.processor.stats().heartbeats, 1);
    }

    #[test]
    fn test_disconnect_rank() {
        let mut h = harness();
        h.register(1, 1, 0.0);
        h.register(1, 2, 0.0);
        h.register(2, 1, 0.0);

        assert_eq!(h.processor.disconnect_rank(Rank(1)).len(), 2);
        assert_eq!(h.processor.registry().len(), 1);
    }

    #[test]
    fn test_send_failure_keeps_processing() {
        let ctx = Arc::new(ManualContext::new(Rank(0)));
        let mut processor = ChannelProcessor::new(ctx, Arc::new(DownTransport(Rank(0))), ProcessorConfig::default());
        processor.initialize().unwrap();
        processor.start_processing().unwrap();

        let envelope = Envelope {
            source_rank: Rank(1),
            target_rank: Rank(0),
            timestamp_nanos: 0,
            sequence_number: 1,
            correlation_id: 1,
        };
        let bytes = Message::new(
            envelope,
            Payload::DeviceRegister(DeviceRegistration {
                device_id: 1,
                position: Position::zeros(),
                antenna_gain_db: 0.0,
                frequency_hz: WIFI,
            }),
        )
        .unwrap()
        .serialize();
        processor.handle_message(&bytes, Rank(1));

        assert_eq!(processor.registry().len(), 1);
        assert_eq!(processor.stats().send_failures, 1);
    }

    #[test]
    fn test_attach_to_dispatcher() {
        let h = harness();
        let mut dispatcher = MessageDispatcher::new();
        let net = h.net.clone();
        let processor = h.processor.attach(&mut dispatcher);

        for kind in CHANNEL_INBOUND_KINDS {
            assert!(dispatcher.has_handler(kind));
        }
        assert!(!dispatcher.has_handler(MessageKind::RxNotification));

        let envelope = Envelope {
            source_rank: Rank(1),
            target_rank: Rank(0),
            timestamp_nanos: 0,
            sequence_number: 1,
            correlation_id: 0,
        };
        let bytes = Message::new(envelope, Payload::Heartbeat).unwrap().serialize();
        dispatcher.deliver(&bytes, Rank(1));

        assert_eq!(processor.lock().unwrap().stats().heartbeats, 1);
        assert_eq!(net.sent_count(), 0);
    }
}
