//! Airwave Counters
//! ================
//!
//! Bookkeeping kept beside the protocol components, never inside their
//! propagation logic:
//! - [`StubCounters`]: shared atomics updated by a device-side stub
//! - [`ProcessorStats`]: plain counters owned by the channel processor
//!
//! Both are observability only. Nothing in the protocol reads them back to
//! make a decision.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Counters of a device-side stub.
///
/// Shared as `Arc<StubCounters>` so hosts and tests can read them while the
/// stub keeps running.
#[derive(Debug, Default)]
pub struct StubCounters {
    endpoints_added: AtomicU64,
    frames_sent: AtomicU64,
    configs_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
    receptions_delivered: AtomicU64,
    errors_received: AtomicU64,
    last_message_id: AtomicU32,
}

impl StubCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_endpoint_added(&self) {
        self.endpoints_added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_config_sent(&self) {
        self.configs_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a message accepted by the transport.
    pub(crate) fn record_sent(&self, sequence_number: u32, len: usize) {
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.last_message_id.store(sequence_number, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reception(&self) {
        self.receptions_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error_received(&self) {
        self.errors_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn endpoints_added(&self) -> u64 {
        self.endpoints_added.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn configs_sent(&self) -> u64 {
        self.configs_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    pub fn receptions_delivered(&self) -> u64 {
        self.receptions_delivered.load(Ordering::Relaxed)
    }

    pub fn errors_received(&self) -> u64 {
        self.errors_received.load(Ordering::Relaxed)
    }

    /// Sequence number of the last message the transport accepted, 0 if none.
    pub fn last_message_id(&self) -> u32 {
        self.last_message_id.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StubStats {
        StubStats {
            endpoints_added: self.endpoints_added(),
            frames_sent: self.frames_sent(),
            configs_sent: self.configs_sent(),
            bytes_sent: self.bytes_sent(),
            send_failures: self.send_failures(),
            receptions_delivered: self.receptions_delivered(),
            errors_received: self.errors_received(),
            last_message_id: self.last_message_id(),
        }
    }
}

/// Point-in-time copy of [`StubCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubStats {
    pub endpoints_added: u64,
    pub frames_sent: u64,
    pub configs_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub receptions_delivered: u64,
    pub errors_received: u64,
    pub last_message_id: u32,
}

/// Counters of the channel-side processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    /// Every buffer handed to the processor
    pub messages_received: u64,
    /// Arrived while not processing
    pub dropped_not_processing: u64,
    /// Failed header validation or decoding
    pub malformed: u64,
    pub unknown_kinds: u64,
    pub registrations: u64,
    pub unregistrations: u64,
    pub position_updates: u64,
    pub heartbeats: u64,
    pub transmissions: u64,
    pub notifications_sent: u64,
    /// Candidate receivers filtered out by the reception threshold
    pub below_threshold: u64,
    pub unregistered_senders: u64,
    pub unregistered_targets: u64,
    pub config_updates: u64,
    pub rejected_configs: u64,
    pub send_failures: u64,
    pub expired_devices: u64,
}

impl ProcessorStats {
    /// Fraction of evaluated receivers that passed the threshold.
    pub fn delivery_ratio(&self) -> f64 {
        let evaluated = self.notifications_sent + self.below_threshold;
        if evaluated == 0 {
            return 0.0;
        }
        self.notifications_sent as f64 / evaluated as f64
    }
}
