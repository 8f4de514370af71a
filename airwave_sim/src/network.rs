//! Simulated network transport with fault injection.
//!
//! Every rank owns a [`SimNetwork`] handle. Sends go into one central FIFO
//! queue; the [`SimRouter`] drains it in send order, applies the
//! [`SimNetworkController`]'s partitions, loss and latency, and pushes each
//! surviving message into the target rank's inbox. One global queue keeps
//! every ordered pair of ranks FIFO.

use crate::context::SimClock;
use airwave_env::{EnvError, NetworkController, NetworkTransport, Rank};
use async_trait::async_trait;
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A message in flight between two ranks.
#[derive(Debug)]
pub struct NetworkMessage {
    pub from: Rank,
    pub to: Rank,
    pub bytes: Bytes,
}

/// Simulated network interface for one rank.
pub struct SimNetwork {
    /// This rank
    local_rank: Rank,

    world_size: u32,

    /// Sender to central router
    tx: mpsc::UnboundedSender<NetworkMessage>,

    /// Receiver for incoming messages (behind tokio mutex for async)
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Rank, Bytes)>>,
}

impl SimNetwork {
    /// Creates a simulated network interface.
    pub fn new(
        local_rank: Rank,
        world_size: u32,
        tx: mpsc::UnboundedSender<NetworkMessage>,
        rx: mpsc::UnboundedReceiver<(Rank, Bytes)>,
    ) -> Self {
        Self {
            local_rank,
            world_size,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Builds a fully connected set of `world_size` ranks plus the router
    /// that moves messages between them.
    pub fn mesh(
        world_size: u32,
        clock: Arc<SimClock>,
        controller: Arc<SimNetworkController>,
    ) -> (SimRouter, Vec<Arc<SimNetwork>>) {
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let mut inboxes = HashMap::new();
        let mut handles = Vec::with_capacity(world_size as usize);

        for raw in 0..world_size {
            let rank = Rank(raw);
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            inboxes.insert(rank, inbox_tx);
            handles.push(Arc::new(SimNetwork::new(rank, world_size, router_tx.clone(), inbox_rx)));
        }

        let router = SimRouter {
            rx: router_rx,
            inboxes: Arc::new(inboxes),
            controller,
            clock,
            stats: RouterStats::default(),
        };
        (router, handles)
    }

    /// Takes the next delivered message without waiting.
    ///
    /// Returns `None` when the inbox is empty or another task holds it.
    pub fn try_recv(&self) -> Option<(Rank, Bytes)> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    fn send(&self, target: Rank, bytes: Bytes) -> Result<(), EnvError> {
        if target.as_u32() >= self.world_size {
            return Err(EnvError::unreachable(target));
        }
        let msg = NetworkMessage {
            from: self.local_rank,
            to: target,
            bytes,
        };

        self.tx
            .send(msg)
            .map_err(|_| EnvError::unavailable("simulated router closed"))
    }

    async fn recv(&self) -> Option<(Rank, Bytes)> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn local_rank(&self) -> Rank {
        self.local_rank
    }
}

/// Counters kept by the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Messages taken off the central queue
    pub routed: u64,

    /// Messages placed in an inbox or scheduled for one
    pub delivered: u64,

    /// Dropped because the pair was partitioned
    pub dropped_partition: u64,

    /// Dropped by the link loss roll
    pub dropped_loss: u64,

    /// Held back by link latency before delivery
    pub delayed: u64,
}

impl RouterStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_partition + self.dropped_loss
    }
}

/// What the controller decides for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkVerdict {
    Deliver { latency_ns: u64 },
    Partitioned,
    Lost,
}

/// Moves messages from the central queue into rank inboxes.
pub struct SimRouter {
    rx: mpsc::UnboundedReceiver<NetworkMessage>,
    inboxes: Arc<HashMap<Rank, mpsc::UnboundedSender<(Rank, Bytes)>>>,
    controller: Arc<SimNetworkController>,
    clock: Arc<SimClock>,
    stats: RouterStats,
}

impl SimRouter {
    /// Drains the central queue. Messages on zero-latency links land in
    /// their inbox immediately; the rest are scheduled on the clock.
    /// Returns how many messages were taken off the queue.
    pub fn route_pending(&mut self) -> usize {
        let mut routed = 0;
        while let Ok(msg) = self.rx.try_recv() {
            routed += 1;
            self.stats.routed += 1;

            match self.controller.admit(msg.from, msg.to) {
                LinkVerdict::Partitioned => {
                    trace!(from = %msg.from, to = %msg.to, "Dropped by partition");
                    self.stats.dropped_partition += 1;
                }
                LinkVerdict::Lost => {
                    trace!(from = %msg.from, to = %msg.to, "Dropped by link loss");
                    self.stats.dropped_loss += 1;
                }
                LinkVerdict::Deliver { latency_ns: 0 } => {
                    if push(&self.inboxes, msg) {
                        self.stats.delivered += 1;
                    }
                }
                LinkVerdict::Deliver { latency_ns } => {
                    self.stats.delayed += 1;
                    self.stats.delivered += 1;
                    let inboxes = self.inboxes.clone();
                    let at = self.clock.time_ns().saturating_add(latency_ns);
                    let from = msg.from;
                    self.clock.schedule(
                        from,
                        at,
                        Box::new(move || {
                            push(&inboxes, msg);
                        }),
                    );
                }
            }
        }
        routed
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        &self.controller
    }
}

fn push(inboxes: &HashMap<Rank, mpsc::UnboundedSender<(Rank, Bytes)>>, msg: NetworkMessage) -> bool {
    match inboxes.get(&msg.to) {
        Some(inbox) => inbox.send((msg.from, msg.bytes)).is_ok(),
        None => {
            debug!(to = %msg.to, "No inbox for rank");
            false
        }
    }
}

/// Network controller for fault injection.
pub struct SimNetworkController {
    /// Per-link latency in nanoseconds
    link_latency: Mutex<HashMap<(Rank, Rank), u64>>,

    /// Per-link message loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<(Rank, Rank), f64>>,

    /// Active partitions (ranks that cannot communicate)
    partitions: Mutex<Vec<(Vec<Rank>, Vec<Rank>)>>,

    /// Seeded RNG for loss rolls
    rng: Mutex<ChaCha8Rng>,
}

impl SimNetworkController {
    /// Creates a controller whose loss rolls follow `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            link_latency: Mutex::new(HashMap::new()),
            link_loss: Mutex::new(HashMap::new()),
            partitions: Mutex::new(Vec::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Sets latency for a directed link.
    pub fn set_latency(&self, from: Rank, to: Rank, latency_ns: u64) {
        let mut latencies = self.link_latency.lock().unwrap_or_else(|p| p.into_inner());
        latencies.insert((from, to), latency_ns);
    }

    /// Checks if two ranks can communicate (not partitioned).
    pub fn can_communicate(&self, from: Rank, to: Rank) -> bool {
        let partitions = self.partitions.lock().unwrap_or_else(|p| p.into_inner());

        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    /// Gets the latency for a link (default 0).
    pub fn latency(&self, from: Rank, to: Rank) -> u64 {
        let latencies = self.link_latency.lock().unwrap_or_else(|p| p.into_inner());
        latencies.get(&(from, to)).copied().unwrap_or(0)
    }

    /// Gets the loss rate for a link (default 0.0).
    pub fn loss(&self, from: Rank, to: Rank) -> f64 {
        let losses = self.link_loss.lock().unwrap_or_else(|p| p.into_inner());
        losses.get(&(from, to)).copied().unwrap_or(0.0)
    }

    /// Decides the fate of one message on `from -> to`.
    pub fn admit(&self, from: Rank, to: Rank) -> LinkVerdict {
        if !self.can_communicate(from, to) {
            return LinkVerdict::Partitioned;
        }
        let loss = self.loss(from, to);
        if loss > 0.0 {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            if rng.gen_bool(loss) {
                return LinkVerdict::Lost;
            }
        }
        LinkVerdict::Deliver {
            latency_ns: self.latency(from, to),
        }
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[Rank], group_b: &[Rank]) {
        debug!(?group_a, ?group_b, "Partition created");
        let mut partitions = self.partitions.lock().unwrap_or_else(|p| p.into_inner());
        partitions.push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        debug!("Partitions healed");
        let mut partitions = self.partitions.lock().unwrap_or_else(|p| p.into_inner());
        partitions.clear();
    }

    fn set_link_loss(&self, from: Rank, to: Rank, loss_rate: f64) {
        let mut losses = self.link_loss.lock().unwrap_or_else(|p| p.into_inner());
        losses.insert((from, to), loss_rate.clamp(0.0, 1.0));
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new(0)
    }
}
