//! Production implementations backed by Tokio.

use crate::context::{ChannelContext, ScheduledEvent};
use crate::error::EnvError;
use crate::network::NetworkTransport;
use crate::types::Rank;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// Production context backed by the Tokio runtime.
///
/// Simulation time is wall-clock time since the context was created.
/// Scheduled events become Tokio tasks that sleep until their deadline, so
/// `schedule_at` must be called from inside a runtime.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    rank: Rank,

    world_size: u32,
}

impl TokioContext {
    /// Creates a new TokioContext for `rank` in a world of `world_size` ranks.
    pub fn new(rank: Rank, world_size: u32) -> Self {
        Self {
            start: Instant::now(),
            rank,
            world_size,
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared(rank: Rank, world_size: u32) -> Arc<Self> {
        Arc::new(Self::new(rank, world_size))
    }
}

impl ChannelContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn schedule_at(&self, at: Duration, event: ScheduledEvent) {
        let deadline = tokio::time::Instant::from_std(self.start + at);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    event();
                });
            }
            Err(e) => {
                tracing::error!(rank = %self.rank, "cannot schedule event outside a runtime: {}", e);
            }
        }
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

/// One rank's handle on an in-process Tokio mesh.
pub struct TokioNetwork {
    local_rank: Rank,

    /// Senders to every rank's inbox, keyed by rank
    peers: Arc<HashMap<Rank, mpsc::UnboundedSender<(Rank, Bytes)>>>,

    /// Receiver for incoming messages (behind tokio mutex for async)
    inbox: Mutex<mpsc::UnboundedReceiver<(Rank, Bytes)>>,
}

#[async_trait]
impl NetworkTransport for TokioNetwork {
    fn send(&self, target: Rank, bytes: Bytes) -> Result<(), EnvError> {
        let peer = self.peers.get(&target).ok_or(EnvError::unreachable(target))?;
        peer.send((self.local_rank, bytes))
            .map_err(|_| EnvError::unavailable(format!("inbox of {} closed", target)))
    }

    async fn recv(&self) -> Option<(Rank, Bytes)> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await
    }

    fn local_rank(&self) -> Rank {
        self.local_rank
    }
}

/// Builder for a fully connected in-process mesh of `TokioNetwork`s.
///
/// Each rank owns one unbounded inbox; a single sender per ordered pair keeps
/// delivery FIFO per pair.
pub struct TokioMesh;

impl TokioMesh {
    /// Creates `world_size` connected transports, indexed by rank.
    pub fn build(world_size: u32) -> Vec<Arc<TokioNetwork>> {
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();

        for raw in 0..world_size {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(Rank(raw), tx);
            receivers.push((Rank(raw), rx));
        }

        let peers = Arc::new(senders);
        receivers
            .into_iter()
            .map(|(rank, rx)| {
                Arc::new(TokioNetwork {
                    local_rank: rank,
                    peers: Arc::clone(&peers),
                    inbox: Mutex::new(rx),
                })
            })
            .collect()
    }
}
