//! Airwave Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction that lets the Airwave channel
//! protocol run on top of any discrete-event scheduler and message substrate:
//! a real multi-process deployment, an in-process Tokio mesh, or the
//! deterministic simulator in `airwave_sim`.
//!
//! # Core Concept: Context Passing
//!
//! Nothing in the protocol reaches for a global transport or clock. Every
//! component receives:
//! - A [`ChannelContext`] supplying `now()`, `schedule_at()` and rank identity
//! - A [`NetworkTransport`] supplying `send(target, bytes)` and `recv()`
//!
//! Swapping the implementations swaps the environment; the protocol code does
//! not change.
//!
//! # Example
//!
//! ```ignore
//! use airwave_env::{ChannelContext, NetworkTransport, Rank};
//!
//! fn announce<Ctx: ChannelContext, Net: NetworkTransport>(ctx: &Ctx, net: &Net) {
//!     let bytes = build_heartbeat(ctx.rank(), ctx.now());
//!     if let Err(e) = net.send(Rank::CHANNEL, bytes) {
//!         tracing::warn!("heartbeat not sent: {}", e);
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;
mod logging_impl;

pub use context::{ChannelContext, ScheduledEvent};
pub use network::{NetworkTransport, NetworkController};
pub use types::Rank;
pub use error::EnvError;
pub use tokio_impl::{TokioContext, TokioMesh, TokioNetwork};
pub use logging_impl::LoggingTransport;
