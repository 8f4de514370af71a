//! Airwave Deterministic Simulation Harness
//!
//! This crate runs the whole distributed channel (one channel rank and any
//! number of device ranks) inside a single process, deterministically.
//!
//! # Core Principle: One Clock, One Queue
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: A shared virtual clock that only the harness advances
//! - **Network**: One central FIFO queue with partitions, loss and latency
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimClock (Virtual Clock + Event Queue)               │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼──────┐                     │
//! │  │ Device  │─────────────►│  Channel  │                     │
//! │  │ rank 1+ │◄─────────────│  rank 0   │                     │
//! │  │ (stub)  │   SimRouter  │(processor)│                     │
//! │  └─────────┘              └───────────┘                     │
//! │                                                             │
//! │  ┌───────────────────────────────────┐                      │
//! │  │            Oracle                 │                      │
//! │  │  (LocalChannel ground truth)      │                      │
//! │  └───────────────────────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use airwave_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4)
//!     .with_duration(1.0)
//!     .run(ScenarioId::Crowd);
//! assert!(result.passed);
//! ```

mod context;
mod device;
mod error;
mod network;
mod oracle;
mod runner;
mod world;
pub mod scenarios;

pub use context::{SimClock, SimContext};
pub use device::{SimulatedDevice, TimedReception, TimedSink};
pub use error::SimError;
pub use network::{LinkVerdict, RouterStats, SimNetwork, SimNetworkController, SimRouter};
pub use oracle::{compare, Comparison, DeviceKey, ExpectedReception, ObservedReception, Oracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimWorld};
