//! Test doubles shared by the unit tests of this crate.

use airwave_env::{ChannelContext, EnvError, NetworkTransport, Rank, ScheduledEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A context whose clock only moves when the test says so.
pub struct ManualContext {
    rank: Rank,
    now_nanos: AtomicU64,
    pending: Mutex<Vec<(Duration, ScheduledEvent)>>,
}

impl ManualContext {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            now_nanos: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Moves the clock to `nanos` and runs every event due by then.
    pub fn advance_to(&self, nanos: u64) {
        self.now_nanos.store(nanos, Ordering::SeqCst);
        let due: Vec<ScheduledEvent> = {
            let mut pending = self.pending.lock().unwrap();
            pending.sort_by_key(|(at, _)| *at);
            let split = pending.partition_point(|(at, _)| at.as_nanos() <= nanos as u128);
            pending.drain(..split).map(|(_, event)| event).collect()
        };
        for event in due {
            event();
        }
    }
}

impl ChannelContext for ManualContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_nanos.load(Ordering::SeqCst))
    }

    fn schedule_at(&self, at: Duration, event: ScheduledEvent) {
        self.pending.lock().unwrap().push((at, event));
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        4
    }

    fn seed(&self) -> u64 {
        0
    }
}

/// A transport that refuses every message.
pub struct DownTransport(pub Rank);

#[async_trait]
impl NetworkTransport for DownTransport {
    fn send(&self, _target: Rank, _bytes: Bytes) -> Result<(), EnvError> {
        Err(EnvError::unavailable("link down"))
    }

    async fn recv(&self) -> Option<(Rank, Bytes)> {
        None
    }

    fn local_rank(&self) -> Rank {
        self.0
    }
}
