//! The Airwave wire protocol.
//!
//! Every message is a fixed 36-byte header followed by a kind-specific
//! payload. All multi-byte fields are big-endian; `f64` fields travel as
//! their IEEE-754 bit pattern. Variable-length sections are always preceded
//! by an explicit `u32` length.
//!
//! ```text
//! 0        4          8           12          16                24        28            32         36
//! | kind   | totalSize| sourceRank| targetRank| timestampNanos  | seqNum  | correlation | reserved |  payload ...
//! ```
//!
//! Decoding never reads past the end of the buffer: a short buffer is a
//! `TruncatedMessage`, a long one a `SizeMismatch`.

use crate::error::ProtocolError;
use crate::types::Position;
use crate::wire::{put_position, put_sized_bytes, WireReader};
use airwave_env::Rank;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Size of the fixed envelope header in bytes.
pub const HEADER_SIZE: usize = 36;

/// Stable message kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    DeviceRegister = 1,
    DeviceUnregister = 2,
    ConfigLossModel = 3,
    ConfigDelayModel = 4,
    TxRequest = 5,
    RxNotification = 6,
    ErrorResponse = 7,
    Heartbeat = 8,
    PositionUpdate = 9,
    RegisterAck = 10,
}

impl MessageKind {
    /// All defined kinds, in wire order.
    pub const ALL: [MessageKind; 10] = [
        MessageKind::DeviceRegister,
        MessageKind::DeviceUnregister,
        MessageKind::ConfigLossModel,
        MessageKind::ConfigDelayModel,
        MessageKind::TxRequest,
        MessageKind::RxNotification,
        MessageKind::ErrorResponse,
        MessageKind::Heartbeat,
        MessageKind::PositionUpdate,
        MessageKind::RegisterAck,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Wire name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::DeviceRegister => "DEVICE_REGISTER",
            MessageKind::DeviceUnregister => "DEVICE_UNREGISTER",
            MessageKind::ConfigLossModel => "CONFIG_LOSS_MODEL",
            MessageKind::ConfigDelayModel => "CONFIG_DELAY_MODEL",
            MessageKind::TxRequest => "TX_REQUEST",
            MessageKind::RxNotification => "RX_NOTIFICATION",
            MessageKind::ErrorResponse => "ERROR_RESPONSE",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::PositionUpdate => "POSITION_UPDATE",
            MessageKind::RegisterAck => "REGISTER_ACK",
        }
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = ProtocolError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_u32() == raw)
            .ok_or(ProtocolError::UnknownKind(raw))
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The decoded fixed header, exactly as it appeared on the wire.
///
/// `kind` stays raw so that a receiver can log and skip kinds it does not
/// know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: u32,
    pub total_size: u32,
    pub source_rank: Rank,
    pub target_rank: Rank,
    pub timestamp_nanos: u64,
    pub sequence_number: u32,
    pub correlation_id: u32,
    pub reserved: u32,
}

impl Header {
    /// Decodes only the header of `bytes`.
    ///
    /// Fails with `TruncatedMessage` if fewer than [`HEADER_SIZE`] bytes are
    /// present. Does not look at the kind or the payload.
    pub fn peek(bytes: &[u8]) -> Result<Header, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::TruncatedMessage {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let mut reader = WireReader::new(bytes);
        Self::read(&mut reader)
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Header, ProtocolError> {
        Ok(Header {
            kind: reader.u32()?,
            total_size: reader.u32()?,
            source_rank: Rank(reader.u32()?),
            target_rank: Rank(reader.u32()?),
            timestamp_nanos: reader.u64()?,
            sequence_number: reader.u32()?,
            correlation_id: reader.u32()?,
            reserved: reader.u32()?,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.kind);
        buf.put_u32(self.total_size);
        buf.put_u32(self.source_rank.as_u32());
        buf.put_u32(self.target_rank.as_u32());
        buf.put_u64(self.timestamp_nanos);
        buf.put_u32(self.sequence_number);
        buf.put_u32(self.correlation_id);
        buf.put_u32(self.reserved);
    }

    /// The typed kind, or `UnknownKind`.
    pub fn message_kind(&self) -> Result<MessageKind, ProtocolError> {
        MessageKind::try_from(self.kind)
    }
}

/// Routing and timing fields supplied by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub source_rank: Rank,
    pub target_rank: Rank,
    /// Simulation time at send
    pub timestamp_nanos: u64,
    pub sequence_number: u32,
    /// Endpoint the message is about, for routing and logs
    pub correlation_id: u32,
}

/// Device → channel: announce an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRegistration {
    /// The owner's endpoint id for the device
    pub device_id: u32,
    pub position: Position,
    pub antenna_gain_db: f64,
    pub frequency_hz: u32,
}

/// Device → channel: withdraw an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceUnregistration {
    pub device_id: u32,
}

/// Device → channel: an endpoint moved.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    pub device_id: u32,
    pub position: Position,
}

/// Which propagation model a configuration update replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConfigKind {
    LossModel = 1,
    DelayModel = 2,
}

impl ConfigKind {
    pub fn name(self) -> &'static str {
        match self {
            ConfigKind::LossModel => "loss",
            ConfigKind::DelayModel => "delay",
        }
    }

    fn from_u32(raw: u32) -> Result<Self, ProtocolError> {
        match raw {
            1 => Ok(ConfigKind::LossModel),
            2 => Ok(ConfigKind::DelayModel),
            other => Err(ProtocolError::InvalidField {
                field: "configKind",
                reason: format!("undefined value {}", other),
            }),
        }
    }
}

/// Device → channel: swap the channel-wide loss or delay model.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationUpdate {
    pub config_kind: ConfigKind,
    pub model_kind: u32,
    /// Opaque model parameters (JSON)
    pub params: Bytes,
}

/// Device → channel: an endpoint transmits a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionRequest {
    pub device_id: u32,
    pub tx_power_watts: f64,
    pub frequency_hz: u32,
    /// Serialized size of the frame, sent in both payload modes
    pub frame_size_bytes: u32,
    /// Frame airtime, 0 when the PHY did not supply one
    pub duration_nanos: u64,
    /// Physical-layer frame; empty in size-only mode
    pub payload: Bytes,
}

impl TransmissionRequest {
    pub fn payload_size_bytes(&self) -> u32 {
        self.frame_size_bytes
    }

    pub fn duration(&self) -> Option<Duration> {
        nanos_to_duration(self.duration_nanos)
    }
}

/// Channel → device: one receiver heard one transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceptionNotification {
    pub receiver_device_id: u32,
    pub transmitter_device_id: u32,
    pub rx_power_dbm: f64,
    pub path_loss_db: f64,
    pub distance_m: f64,
    pub frequency_hz: u32,
    pub propagation_delay_nanos: u64,
    pub tx_timestamp_nanos: u64,
    /// Serialized size of the transmitted frame
    pub frame_size_bytes: u32,
    /// Airtime of the transmitted frame, 0 when unknown
    pub duration_nanos: u64,
    /// Echo of the transmitted frame, if the channel is configured to echo
    pub payload: Bytes,
}

impl ReceptionNotification {
    pub fn rx_power_watts(&self) -> f64 {
        crate::propagation::dbm_to_watts(self.rx_power_dbm)
    }

    /// Simulation time at which the signal reaches the receiver.
    pub fn arrival_nanos(&self) -> u64 {
        self.tx_timestamp_nanos.saturating_add(self.propagation_delay_nanos)
    }

    pub fn duration(&self) -> Option<Duration> {
        nanos_to_duration(self.duration_nanos)
    }
}

fn nanos_to_duration(nanos: u64) -> Option<Duration> {
    (nanos > 0).then(|| Duration::from_nanos(nanos))
}

/// Wire value for an optional airtime.
pub fn duration_to_nanos(duration: Option<Duration>) -> u64 {
    duration.map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

/// A frame that travels with its bytes must agree with its declared size.
fn check_frame_size(frame_size_bytes: u32, payload: &Bytes) -> Result<(), ProtocolError> {
    if payload.is_empty() || payload.len() == frame_size_bytes as usize {
        Ok(())
    } else {
        Err(ProtocolError::InvalidField {
            field: "frameSizeBytes",
            reason: format!("declares {} bytes but carries {}", frame_size_bytes, payload.len()),
        })
    }
}

/// Reason codes carried by `ERROR_RESPONSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnregisteredSender,
    UnregisteredTarget,
    Malformed,
    InvalidModel,
    /// A code this build does not know
    Other(u32),
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::UnregisteredSender => 1,
            ErrorCode::UnregisteredTarget => 2,
            ErrorCode::Malformed => 3,
            ErrorCode::InvalidModel => 4,
            ErrorCode::Other(raw) => raw,
        }
    }

    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => ErrorCode::UnregisteredSender,
            2 => ErrorCode::UnregisteredTarget,
            3 => ErrorCode::Malformed,
            4 => ErrorCode::InvalidModel,
            other => ErrorCode::Other(other),
        }
    }
}

/// Channel → device: a request was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    /// Sequence number of the offending message
    pub related_sequence: u32,
    pub message: String,
}

/// Channel → device: registration accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAck {
    pub endpoint_id: u32,
    pub device_id: u32,
}

/// Kind-specific message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    DeviceRegister(DeviceRegistration),
    DeviceUnregister(DeviceUnregistration),
    ConfigLossModel(ConfigurationUpdate),
    ConfigDelayModel(ConfigurationUpdate),
    TxRequest(TransmissionRequest),
    RxNotification(ReceptionNotification),
    ErrorResponse(ErrorResponse),
    Heartbeat,
    PositionUpdate(PositionUpdate),
    RegisterAck(RegisterAck),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::DeviceRegister(_) => MessageKind::DeviceRegister,
            Payload::DeviceUnregister(_) => MessageKind::DeviceUnregister,
            Payload::ConfigLossModel(_) => MessageKind::ConfigLossModel,
            Payload::ConfigDelayModel(_) => MessageKind::ConfigDelayModel,
            Payload::TxRequest(_) => MessageKind::TxRequest,
            Payload::RxNotification(_) => MessageKind::RxNotification,
            Payload::ErrorResponse(_) => MessageKind::ErrorResponse,
            Payload::Heartbeat => MessageKind::Heartbeat,
            Payload::PositionUpdate(_) => MessageKind::PositionUpdate,
            Payload::RegisterAck(_) => MessageKind::RegisterAck,
        }
    }

    /// Encoded payload length in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Payload::DeviceRegister(_) => 4 + 3 * 8 + 8 + 4,
            Payload::DeviceUnregister(_) => 4,
            Payload::ConfigLossModel(c) | Payload::ConfigDelayModel(c) => 3 * 4 + c.params.len(),
            Payload::TxRequest(t) => 4 + 8 + 4 + 4 + 8 + 4 + t.payload.len(),
            Payload::RxNotification(r) => 4 + 4 + 3 * 8 + 4 + 8 + 8 + 4 + 8 + 4 + r.payload.len(),
            Payload::ErrorResponse(e) => 3 * 4 + e.message.len(),
            Payload::Heartbeat => 0,
            Payload::PositionUpdate(_) => 4 + 3 * 8,
            Payload::RegisterAck(_) => 8,
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            Payload::DeviceRegister(r) => {
                buf.put_u32(r.device_id);
                put_position(buf, &r.position);
                buf.put_f64(r.antenna_gain_db);
                buf.put_u32(r.frequency_hz);
            }
            Payload::DeviceUnregister(u) => buf.put_u32(u.device_id),
            Payload::ConfigLossModel(c) | Payload::ConfigDelayModel(c) => {
                buf.put_u32(c.config_kind as u32);
                buf.put_u32(c.model_kind);
                put_sized_bytes(buf, &c.params);
            }
            Payload::TxRequest(t) => {
                buf.put_u32(t.device_id);
                buf.put_f64(t.tx_power_watts);
                buf.put_u32(t.frequency_hz);
                buf.put_u32(t.frame_size_bytes);
                buf.put_u64(t.duration_nanos);
                put_sized_bytes(buf, &t.payload);
            }
            Payload::RxNotification(r) => {
                buf.put_u32(r.receiver_device_id);
                buf.put_u32(r.transmitter_device_id);
                buf.put_f64(r.rx_power_dbm);
                buf.put_f64(r.path_loss_db);
                buf.put_f64(r.distance_m);
                buf.put_u32(r.frequency_hz);
                buf.put_u64(r.propagation_delay_nanos);
                buf.put_u64(r.tx_timestamp_nanos);
                buf.put_u32(r.frame_size_bytes);
                buf.put_u64(r.duration_nanos);
                put_sized_bytes(buf, &r.payload);
            }
            Payload::ErrorResponse(e) => {
                buf.put_u32(e.code.as_u32());
                buf.put_u32(e.related_sequence);
                put_sized_bytes(buf, e.message.as_bytes());
            }
            Payload::Heartbeat => {}
            Payload::PositionUpdate(p) => {
                buf.put_u32(p.device_id);
                put_position(buf, &p.position);
            }
            Payload::RegisterAck(a) => {
                buf.put_u32(a.endpoint_id);
                buf.put_u32(a.device_id);
            }
        }
    }

    fn read(kind: MessageKind, reader: &mut WireReader<'_>) -> Result<Payload, ProtocolError> {
        let payload = match kind {
            MessageKind::DeviceRegister => Payload::DeviceRegister(DeviceRegistration {
                device_id: reader.u32()?,
                position: reader.position()?,
                antenna_gain_db: reader.f64()?,
                frequency_hz: reader.u32()?,
            }),
            MessageKind::DeviceUnregister => Payload::DeviceUnregister(DeviceUnregistration {
                device_id: reader.u32()?,
            }),
            MessageKind::ConfigLossModel | MessageKind::ConfigDelayModel => {
                let update = ConfigurationUpdate {
                    config_kind: ConfigKind::from_u32(reader.u32()?)?,
                    model_kind: reader.u32()?,
                    params: reader.sized_bytes()?,
                };
                if kind == MessageKind::ConfigLossModel {
                    Payload::ConfigLossModel(update)
                } else {
                    Payload::ConfigDelayModel(update)
                }
            }
            MessageKind::TxRequest => {
                let request = TransmissionRequest {
                    device_id: reader.u32()?,
                    tx_power_watts: reader.f64()?,
                    frequency_hz: reader.u32()?,
                    frame_size_bytes: reader.u32()?,
                    duration_nanos: reader.u64()?,
                    payload: reader.sized_bytes()?,
                };
                check_frame_size(request.frame_size_bytes, &request.payload)?;
                Payload::TxRequest(request)
            }
            MessageKind::RxNotification => {
                let notification = ReceptionNotification {
                    receiver_device_id: reader.u32()?,
                    transmitter_device_id: reader.u32()?,
                    rx_power_dbm: reader.f64()?,
                    path_loss_db: reader.f64()?,
                    distance_m: reader.f64()?,
                    frequency_hz: reader.u32()?,
                    propagation_delay_nanos: reader.u64()?,
                    tx_timestamp_nanos: reader.u64()?,
                    frame_size_bytes: reader.u32()?,
                    duration_nanos: reader.u64()?,
                    payload: reader.sized_bytes()?,
                };
                check_frame_size(notification.frame_size_bytes, &notification.payload)?;
                Payload::RxNotification(notification)
            }
            MessageKind::ErrorResponse => {
                let code = ErrorCode::from_u32(reader.u32()?);
                let related_sequence = reader.u32()?;
                let text = reader.sized_bytes()?;
                let message = String::from_utf8(text.to_vec()).map_err(|e| {
                    ProtocolError::InvalidField {
                        field: "errorMessage",
                        reason: e.to_string(),
                    }
                })?;
                Payload::ErrorResponse(ErrorResponse {
                    code,
                    related_sequence,
                    message,
                })
            }
            MessageKind::Heartbeat => Payload::Heartbeat,
            MessageKind::PositionUpdate => Payload::PositionUpdate(PositionUpdate {
                device_id: reader.u32()?,
                position: reader.position()?,
            }),
            MessageKind::RegisterAck => Payload::RegisterAck(RegisterAck {
                endpoint_id: reader.u32()?,
                device_id: reader.u32()?,
            }),
        };
        Ok(payload)
    }
}

/// A complete protocol message: header plus payload.
///
/// Immutable once built; `kind` and `totalSize` are derived from the payload
/// so they can never disagree with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    header: Header,
    payload: Payload,
}

impl Message {
    /// Builds a message, deriving `kind` and `totalSize`.
    ///
    /// Fails with `Oversized` if the message cannot be described by the
    /// 32-bit size fields.
    pub fn new(envelope: Envelope, payload: Payload) -> Result<Self, ProtocolError> {
        let size = HEADER_SIZE + payload.encoded_len();
        let total_size = u32::try_from(size).map_err(|_| ProtocolError::Oversized { size })?;

        let header = Header {
            kind: payload.kind().as_u32(),
            total_size,
            source_rank: envelope.source_rank,
            target_rank: envelope.target_rank,
            timestamp_nanos: envelope.timestamp_nanos,
            sequence_number: envelope.sequence_number,
            correlation_id: envelope.correlation_id,
            reserved: 0,
        };
        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Encodes the message in network byte order.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.total_size as usize);
        self.header.write(&mut buf);
        self.payload.write(&mut buf);
        buf.freeze()
    }

    /// Decodes and checks a complete message.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::peek(bytes)?;
        let kind = header.message_kind()?;

        let declared = header.total_size as usize;
        if bytes.len() < declared {
            return Err(ProtocolError::TruncatedMessage {
                needed: declared,
                available: bytes.len(),
            });
        }
        if bytes.len() > declared {
            return Err(ProtocolError::SizeMismatch {
                declared: header.total_size,
                actual: bytes.len(),
            });
        }

        let mut reader = WireReader::new(&bytes[HEADER_SIZE.min(declared)..]);
        let payload = Payload::read(kind, &mut reader)?;
        reader.finish(header.total_size)?;

        Ok(Self { header, payload })
    }
}

/// Encodes `message` (see [`Message::serialize`]).
pub fn serialize(message: &Message) -> Bytes {
    message.serialize()
}

/// Decodes `bytes` (see [`Message::deserialize`]).
pub fn deserialize(bytes: &[u8]) -> Result<Message, ProtocolError> {
    Message::deserialize(bytes)
}

/// Per-process monotonically increasing sequence numbers.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    last: u32,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number (starting at 1, wrapping).
    pub fn next(&mut self) -> u32 {
        self.last = self.last.wrapping_add(1);
        self.last
    }

    /// Last number handed out, 0 if none.
    pub fn last(&self) -> u32 {
        self.last
    }
}
