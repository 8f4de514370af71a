//! Airwave Core - Distributed Wireless Channel Protocol
//!
//! This library splits one shared-medium wireless channel across processes:
//! 1. **Device ranks** host endpoints and talk to the channel through a
//!    [`RemoteChannelStub`], which turns every channel operation into a message
//! 2. **The channel rank** runs the [`ChannelProcessor`], which owns the
//!    [`DeviceRegistry`] and the [`PropagationEngine`] and answers every
//!    transmission with per-receiver reception notifications
//! 3. **The wire protocol** in [`message`] connects the two
//!
//! Everything is driven through the context and transport abstractions in
//! `airwave_env`, so the same code runs under Tokio and under the
//! deterministic simulator.

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod local;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod propagation;
pub mod registry;
pub mod stub;
pub mod types;
pub mod validation;

mod wire;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use config::{AirwaveConfig, PayloadMode, ProcessorConfig, StubConfig};
pub use dispatcher::{Delivery, MessageDispatcher};
pub use endpoint::{
    ChannelParameters, ChannelTransport, CollectingSink, EndpointDescriptor, Frame, Reception,
    ReceptionSink, StaticEndpoint, WirelessEndpoint,
};
pub use error::{ConfigError, ModelError, ProcessorError, ProtocolError};
pub use local::LocalChannel;
pub use message::{Header, Message, MessageKind, Payload, HEADER_SIZE};
pub use metrics::{ProcessorStats, StubCounters, StubStats};
pub use processor::{ChannelProcessor, ProcessorState};
pub use propagation::{DelayModelSpec, LossModelSpec, PropagationEngine};
pub use registry::{DeviceRecord, DeviceRegistry};
pub use stub::RemoteChannelStub;
pub use types::{DeviceId, EndpointId, Position};
pub use validation::{validate_header, ValidationLimits};
