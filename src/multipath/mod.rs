//! Multipath sending and reassembly.
//!
//! This module implements the per-flow engine:
//! - Flow and path descriptions with derived unit sizes and split ratios
//! - Transport channel abstraction with an in-memory implementation
//! - Weighted path scheduling with per-path backpressure
//! - Resequencing of units arriving over several paths

mod channel;
mod flow;
mod reassembly;
mod receiver;
mod scheduler;

pub use channel::{MemoryChannel, MemoryLink, TransportChannel};
pub use flow::{FlowSpec, PathSpec};
pub use reassembly::{DeliveredUnit, DuplicatePolicy, ReassemblyBuffer, ReassemblyConfig, ReassemblyStats};
pub use receiver::MultipathReceiver;
pub use scheduler::{
    DrainPolicy, PathScheduler, SchedulerConfig, SchedulerState, SchedulerStats, SendOutcome,
};
