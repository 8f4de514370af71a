//! Simulation context implementing ChannelContext for deterministic testing.

use airwave_env::{ChannelContext, Rank, ScheduledEvent};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

/// An event waiting in the clock's queue.
struct QueuedEvent {
    at_ns: u64,
    /// Insertion order; breaks ties between events due at the same instant
    seq: u64,
    rank: Rank,
    event: ScheduledEvent,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.at_ns == other.at_ns && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at_ns, self.seq).cmp(&(other.at_ns, other.seq))
    }
}

/// The one virtual clock every simulated rank shares.
///
/// Time only moves when the harness moves it. Scheduled events run in
/// `(time, insertion order)` order, and the clock reads exactly the event's
/// due time while the event runs.
pub struct SimClock {
    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Mutex<u64>,

    queue: Mutex<BinaryHeap<Reverse<QueuedEvent>>>,

    next_seq: Mutex<u64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            virtual_time_ns: Mutex::new(0),
            queue: Mutex::new(BinaryHeap::new()),
            next_seq: Mutex::new(0),
        }
    }

    /// Creates an Arc-wrapped clock for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queues `event` to run at `at_ns`. Events in the past run on the next
    /// `run_due`, never synchronously.
    pub fn schedule(&self, rank: Rank, at_ns: u64, event: ScheduledEvent) {
        let seq = {
            let mut next = self.next_seq.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            *next
        };
        trace!(%rank, at_ns, seq, "Event scheduled");
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Reverse(QueuedEvent { at_ns, seq, rank, event }));
    }

    /// Number of events still queued.
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Due time of the earliest queued event.
    pub fn next_event_ns(&self) -> Option<u64> {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .peek()
            .map(|Reverse(e)| e.at_ns)
    }

    /// Moves the clock forward without running anything. Never moves it back.
    pub fn advance_to(&self, time_ns: u64) {
        let mut now = self.virtual_time_ns.lock().unwrap_or_else(|p| p.into_inner());
        if time_ns > *now {
            *now = time_ns;
        }
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let step = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.advance_to(self.time_ns().saturating_add(step));
    }

    /// Runs every event due at or before the current time, including events
    /// those events schedule for the current time. Returns how many ran.
    pub fn run_due(&self) -> usize {
        self.run_until(self.time_ns())
    }

    /// Runs queued events in order up to and including `time_ns`, stepping
    /// the clock to each event's due time, then leaves the clock at
    /// `time_ns`. Returns how many events ran.
    pub fn run_until(&self, time_ns: u64) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
                match queue.peek() {
                    Some(Reverse(e)) if e.at_ns <= time_ns => queue.pop(),
                    _ => None,
                }
            };
            // The queue lock is released here; events may schedule more events.
            let Some(Reverse(queued)) = next else { break };
            self.advance_to(queued.at_ns);
            trace!(rank = %queued.rank, at_ns = queued.at_ns, "Running event");
            (queued.event)();
            ran += 1;
        }
        self.advance_to(time_ns);
        ran
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One rank's view of the shared [`SimClock`].
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    rank: Rank,

    world_size: u32,

    clock: Arc<SimClock>,
}

impl SimContext {
    /// Creates a context for `rank` over `clock`.
    pub fn new(clock: Arc<SimClock>, rank: Rank, world_size: u32, seed: u64) -> Self {
        Self {
            seed,
            rank,
            world_size,
            clock,
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(clock: Arc<SimClock>, rank: Rank, world_size: u32, seed: u64) -> Arc<Self> {
        Arc::new(Self::new(clock, rank, world_size, seed))
    }

    pub fn clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        self.clock.time_ns()
    }

    /// Deterministic RNG for one subsystem of this rank.
    ///
    /// The same seed, rank and stream always give the same sequence, and
    /// different streams never share one.
    pub fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        let combined_seed = self.seed.wrapping_mul(0x517cc1b727220a95)
            ^ (self.rank.as_u32() as u64).wrapping_mul(0x9e3779b97f4a7c15)
            ^ stream;
        ChaCha8Rng::seed_from_u64(combined_seed)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            rank: self.rank,
            world_size: self.world_size,
            clock: Arc::clone(&self.clock),
        }
    }
}

impl ChannelContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.clock.time_ns())
    }

    fn schedule_at(&self, at: Duration, event: ScheduledEvent) {
        let at_ns = u64::try_from(at.as_nanos()).unwrap_or(u64::MAX);
        self.clock.schedule(self.rank, at_ns, event);
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn recorder() -> (Arc<Mutex<Vec<(u64, &'static str)>>>, Arc<SimClock>) {
        (Arc::new(Mutex::new(Vec::new())), SimClock::shared())
    }

    #[test]
    fn test_sim_context_time() {
        let clock = SimClock::shared();
        let ctx = SimContext::new(clock.clone(), Rank(1), 2, 42);
        assert_eq!(ctx.now(), Duration::ZERO);

        clock.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        clock.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));

        // Never backwards
        clock.advance_to(10);
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_sim_context_identity() {
        let ctx = SimContext::new(SimClock::shared(), Rank(3), 5, 12345);
        assert_eq!(ctx.rank(), Rank(3));
        assert_eq!(ctx.world_size(), 5);
        assert_eq!(ctx.seed(), 12345);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(SimClock::shared(), Rank(0), 2, 42);
        let ctx2 = ctx1.clone();

        ctx1.clock().advance_time(Duration::from_secs(5));

        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[test]
    fn test_sim_context_deterministic_rng() {
        let clock = SimClock::shared();
        let a = SimContext::new(clock.clone(), Rank(1), 3, 42);
        let b = SimContext::new(clock.clone(), Rank(1), 3, 42);
        let other_rank = SimContext::new(clock, Rank(2), 3, 42);

        let x: u64 = a.derive_rng(7).gen();
        assert_eq!(x, b.derive_rng(7).gen::<u64>());
        assert_ne!(x, a.derive_rng(8).gen::<u64>());
        assert_ne!(x, other_rank.derive_rng(7).gen::<u64>());
    }

    #[test]
    fn test_sim_clock_runs_in_time_order() {
        let (log, clock) = recorder();
        let ctx = SimContext::new(clock.clone(), Rank(1), 2, 0);

        for (at, name) in [(300, "c"), (100, "a"), (200, "b")] {
            let log = log.clone();
            let clock = clock.clone();
            ctx.schedule_at(
                Duration::from_nanos(at),
                Box::new(move || log.lock().unwrap().push((clock.time_ns(), name))),
            );
        }
        assert_eq!(clock.pending(), 3);
        assert_eq!(clock.next_event_ns(), Some(100));

        assert_eq!(clock.run_until(250), 2);
        assert_eq!(clock.time_ns(), 250);
        assert_eq!(*log.lock().unwrap(), vec![(100, "a"), (200, "b")]);

        assert_eq!(clock.run_until(1_000), 1);
        assert_eq!(log.lock().unwrap().last(), Some(&(300, "c")));
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_sim_clock_same_instant_is_fifo() {
        let (log, clock) = recorder();
        for name in ["first", "second", "third"] {
            let log = log.clone();
            clock.schedule(Rank(0), 50, Box::new(move || log.lock().unwrap().push((50, name))));
        }
        clock.run_until(50);

        let names: Vec<_> = log.lock().unwrap().iter().map(|(_, n)| *n).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_sim_clock_past_events_wait_for_run_due() {
        let (log, clock) = recorder();
        clock.advance_to(1_000);

        let inner = log.clone();
        clock.schedule(Rank(0), 10, Box::new(move || inner.lock().unwrap().push((10, "late"))));
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(clock.run_due(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
        // Running a late event does not rewind the clock
        assert_eq!(clock.time_ns(), 1_000);
    }

    #[test]
    fn test_sim_clock_events_can_schedule_events() {
        let (log, clock) = recorder();
        let outer_clock = clock.clone();
        let outer_log = log.clone();
        clock.schedule(
            Rank(0),
            10,
            Box::new(move || {
                let log = outer_log.clone();
                outer_clock.schedule(Rank(0), 20, Box::new(move || log.lock().unwrap().push((20, "nested"))));
            }),
        );

        assert_eq!(clock.run_until(100), 2);
        assert_eq!(*log.lock().unwrap(), vec![(20, "nested")]);
    }

    proptest::proptest! {
        #[test]
        fn test_sim_clock_never_runs_out_of_order(times in proptest::collection::vec(0u64..10_000, 1..64)) {
            let clock = SimClock::shared();
            let seen = Arc::new(Mutex::new(Vec::new()));
            for (i, at) in times.iter().copied().enumerate() {
                let seen = seen.clone();
                let inner = clock.clone();
                clock.schedule(Rank(0), at, Box::new(move || seen.lock().unwrap().push((inner.time_ns(), i))));
            }

            proptest::prop_assert_eq!(clock.run_until(10_000), times.len());
            let seen = seen.lock().unwrap();
            for pair in seen.windows(2) {
                proptest::prop_assert!(pair[0] <= pair[1]);
            }
            for (at, i) in seen.iter() {
                proptest::prop_assert_eq!(*at, times[*i]);
            }
        }
    }
}
