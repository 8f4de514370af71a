//! Core environment context trait for Airwave processes.

use crate::types::Rank;
use std::time::Duration;

/// A deferred piece of work handed to the scheduler.
pub type ScheduledEvent = Box<dyn FnOnce() + Send + 'static>;

/// The central interface to the enclosing discrete-event scheduler.
///
/// This trait abstracts the scheduler so the channel protocol can run
/// under a production event loop (tokio) or the deterministic simulator.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wall clock since start, `tokio::spawn`
/// - **Simulation**: `SimContext` - shared virtual clock and event queue
///
/// # Threading
///
/// The protocol assumes the scheduler never runs two events concurrently on
/// the same rank. Implementations are `Send + Sync` only so that handles can
/// be shared; they do not make the protocol components thread-safe.
pub trait ChannelContext: Send + Sync + 'static {
    /// Returns the current simulation time.
    ///
    /// Every rank observes the same global simulation clock by convention;
    /// synchronization between ranks is the scheduler's business.
    fn now(&self) -> Duration;

    /// Runs `event` when simulation time reaches `at`.
    ///
    /// Times in the past run at the next opportunity, never synchronously
    /// inside this call.
    fn schedule_at(&self, at: Duration, event: ScheduledEvent);

    /// Returns the rank of the hosting process.
    fn rank(&self) -> Rank;

    /// Returns the number of participating ranks.
    fn world_size(&self) -> u32;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;

    /// Current simulation time in nanoseconds, saturating at `u64::MAX`.
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.now().as_nanos()).unwrap_or(u64::MAX)
    }
}
