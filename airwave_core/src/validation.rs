//! Header Validation
//! =================
//!
//! Receiver-side checks applied to every inbound header before dispatch:
//! - the header's `sourceRank` must match the rank the transport reported
//! - `totalSize` must lie within `[HEADER_SIZE, max_message_size]`
//! - `timestampNanos` may not run ahead of local time beyond a tolerance
//!
//! The size bound guards against corrupt length fields and the timestamp
//! bound catches unsynchronized senders. Neither is a scheduling mechanism.

use crate::error::ProtocolError;
use crate::message::{Header, HEADER_SIZE};
use airwave_env::Rank;
use serde::{Deserialize, Serialize};

/// Default upper bound on an accepted message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1_000_000;

/// Default allowance for sender timestamps ahead of local time (1 s).
pub const DEFAULT_TIMESTAMP_TOLERANCE_NANOS: u64 = 1_000_000_000;

/// Bounds applied by [`check_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_message_size: u32,
    pub timestamp_tolerance_nanos: u64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            timestamp_tolerance_nanos: DEFAULT_TIMESTAMP_TOLERANCE_NANOS,
        }
    }
}

/// Checks `header` against the sender the transport reported and the
/// receiver's current simulation time. Returns the first failing reason.
pub fn check_header(
    header: &Header,
    expected_source: Rank,
    now_nanos: u64,
    limits: &ValidationLimits,
) -> Result<(), ProtocolError> {
    if header.source_rank != expected_source {
        return Err(ProtocolError::SourceRankMismatch {
            claimed: header.source_rank,
            actual: expected_source,
        });
    }

    let min = HEADER_SIZE as u32;
    if header.total_size < min || header.total_size > limits.max_message_size {
        return Err(ProtocolError::SizeOutOfBounds {
            size: header.total_size,
            min,
            max: limits.max_message_size,
        });
    }

    if header.timestamp_nanos > now_nanos.saturating_add(limits.timestamp_tolerance_nanos) {
        return Err(ProtocolError::TimestampInFuture {
            timestamp_nanos: header.timestamp_nanos,
            now_nanos,
            tolerance_nanos: limits.timestamp_tolerance_nanos,
        });
    }

    Ok(())
}

/// Boolean form of [`check_header`].
pub fn validate_header(
    header: &Header,
    expected_source: Rank,
    now_nanos: u64,
    limits: &ValidationLimits,
) -> bool {
    check_header(header, expected_source, now_nanos, limits).is_ok()
}
