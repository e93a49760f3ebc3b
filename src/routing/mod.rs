//! Forwarding and path-selection tables.
//!
//! - [`SplitRatioTable`]: per-flow weighted choices with a one-time
//!   reconciliation into a cumulative distribution. Used as a switch
//!   forwarding table and as a sender's path-selection table.
//! - [`ForwardingTable`]: weighted or deterministic table behind one interface.
//! - [`Switch`] / [`SwitchFabric`]: switches owning a table and a random source.

mod forwarding;
mod split_ratio;

pub use forwarding::{DeterministicTable, ForwardingTable, Hop, Switch, SwitchFabric, SwitchKind};
pub use split_ratio::{SplitRatioTable, WeightedChoice};
