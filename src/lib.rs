//! # mpflow
//!
//! Multipath flow scheduling and in-order resequencing for network-simulation
//! scenarios.
//!
//! A flow is split across several paths. For every application unit the
//! sender draws a path from the flow's split ratios, tags the unit with an
//! 8-byte sequence number and hands it to that path's transport channel,
//! deferring it in a per-path FIFO while the channel is full. The receiver
//! defragments byte streams back into units, strips the tag and releases
//! units to the application strictly in sequence order.
//!
//! ## Layout
//!
//! - [`routing`]: weighted split-ratio tables and the switch fabric that forwards with them
//! - [`protocol`]: the sequence tag, stream defragmentation and a unit codec
//! - [`multipath`]: flow and path descriptions, the path scheduler, the reassembly buffer
//! - [`runtime`]: per-flow tokio tasks driven by event channels
//! - [`sim`]: an in-process scenario driver over simulated links
//! - [`metrics`]: transmission and delivery records

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
// Rates are f64 bit/s; byte counts and ids convert to and from them.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::similar_names)]             // seq/seen, path/paths
#![allow(clippy::significant_drop_tightening)] // MemoryLink guards span a whole send
#![allow(clippy::option_if_let_else)]
#![allow(clippy::return_self_not_must_use)]  // with_* builders
#![allow(clippy::too_many_lines)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod multipath;
pub mod protocol;
pub mod routing;
pub mod runtime;
pub mod sim;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::{MemorySink, MetricsSink};
    pub use crate::multipath::{
        FlowSpec, MemoryChannel, MultipathReceiver, PathScheduler, PathSpec, ReassemblyBuffer,
        TransportChannel,
    };
    pub use crate::protocol::{tag, untag, StreamDefragmenter};
    pub use crate::routing::{SplitRatioTable, SwitchFabric};
    pub use crate::runtime::{spawn_receiver, spawn_sender};
    pub use crate::sim::Scenario;
    pub use crate::types::*;
}
