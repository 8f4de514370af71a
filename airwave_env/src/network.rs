//! Network transport abstraction between Airwave ranks.

use async_trait::async_trait;
use bytes::Bytes;
use crate::error::EnvError;
use crate::types::Rank;

/// Point-to-point message passing between ranks.
///
/// # Implementations
///
/// - **Production**: `TokioNetwork` (in-process mesh), or an MPI binding
/// - **Simulation**: `SimNetwork` routed through a central queue with faults
/// - **Fallback**: `LoggingTransport` records what would have been sent
///
/// # Ordering
///
/// Implementations must deliver messages from one source rank to one target
/// rank in the order they were sent (FIFO per ordered pair). No ordering is
/// promised across different source ranks.
///
/// ```text
/// Device rank 2              Transport               Channel rank 0
///   |                           |                          |
///   |-- send(0, bytes) -------->|                          |
///   |   (returns immediately)   |-- deliver in order ----->|
///   |                           |                          |-- recv() -> (2, bytes)
/// ```
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Hands `bytes` to the transport for delivery to `target`.
    ///
    /// Never blocks. `Ok(())` means the transport accepted the message, not
    /// that it was delivered.
    ///
    /// # Errors
    /// * `EnvError::TransportUnavailable` - the transport is closed or absent
    /// * `EnvError::RankUnreachable` - `target` is unknown
    fn send(&self, target: Rank, bytes: Bytes) -> Result<(), EnvError>;

    /// Receives the next message addressed to this rank.
    ///
    /// # Returns
    /// * `Some((source, bytes))` - a message was received
    /// * `None` - the transport was closed (shutdown)
    async fn recv(&self) -> Option<(Rank, Bytes)>;

    /// Returns this process's rank.
    fn local_rank(&self) -> Rank;
}

/// Fault injection for simulated transports.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two rank sets.
    fn partition(&self, group_a: &[Rank], group_b: &[Rank]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets message loss probability for a directed link (0.0 - 1.0).
    fn set_link_loss(&self, from: Rank, to: Rank, loss_rate: f64);
}
