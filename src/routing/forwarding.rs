//! Switch forwarding over weighted or deterministic tables.

use std::collections::BTreeMap;
use std::fmt;

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::SplitRatioTable;
use crate::error::{Result, RoutingError};
use crate::types::{FlowKey, PortId, SwitchId};
use crate::util::DrawSource;

/// Forwarding behaviour of a switch, chosen once when the topology is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchKind {
    /// Per-packet weighted split across every port a flow's paths use.
    #[default]
    Weighted,
    /// Exactly one port per flow.
    Deterministic,
}

impl fmt::Display for SwitchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weighted => write!(f, "weighted"),
            Self::Deterministic => write!(f, "deterministic"),
        }
    }
}

/// One target per flow key.
#[derive(Debug, Clone)]
pub struct DeterministicTable<T> {
    entries: BTreeMap<FlowKey, T>,
}

impl<T> Default for DeterministicTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: fmt::Debug> DeterministicTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the single target for `flow`. A second entry for the same key is rejected.
    pub fn add_entry(&mut self, flow: FlowKey, target: T) -> Result<()> {
        if self.entries.contains_key(&flow) {
            return Err(RoutingError::DuplicateEntry { flow }.into());
        }
        tracing::debug!(flow = %flow, target = ?target, "Adding deterministic entry");
        self.entries.insert(flow, target);
        Ok(())
    }

    pub fn lookup(&self, flow: &FlowKey) -> Result<&T> {
        self.entries
            .get(flow)
            .ok_or_else(|| RoutingError::TableMiss { flow: *flow }.into())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Forwarding table of either kind behind one interface.
#[derive(Debug, Clone)]
pub enum ForwardingTable<T> {
    Weighted(SplitRatioTable<T>),
    Deterministic(DeterministicTable<T>),
}

impl<T: Clone + fmt::Debug> ForwardingTable<T> {
    pub fn new(kind: SwitchKind) -> Self {
        match kind {
            SwitchKind::Weighted => Self::Weighted(SplitRatioTable::new()),
            SwitchKind::Deterministic => Self::Deterministic(DeterministicTable::new()),
        }
    }

    pub fn kind(&self) -> SwitchKind {
        match self {
            Self::Weighted(_) => SwitchKind::Weighted,
            Self::Deterministic(_) => SwitchKind::Deterministic,
        }
    }

    /// Add a forwarding entry. Deterministic tables ignore `weight`.
    pub fn add_entry(&mut self, flow: FlowKey, weight: f64, target: T) -> Result<()> {
        match self {
            Self::Weighted(table) => table.add_choice(flow, weight, target),
            Self::Deterministic(table) => table.add_entry(flow, target),
        }
    }

    /// Finish setup. Only weighted tables have work to do.
    pub fn reconcile(&mut self) -> Result<()> {
        match self {
            Self::Weighted(table) => table.reconcile(),
            Self::Deterministic(_) => Ok(()),
        }
    }

    /// Resolve the target for `flow`. Deterministic tables never draw.
    pub fn forward<D: DrawSource + ?Sized>(&self, flow: &FlowKey, draws: &mut D) -> Result<&T> {
        match self {
            Self::Weighted(table) => table.select_with(flow, draws),
            Self::Deterministic(table) => table.lookup(flow),
        }
    }
}

/// A forwarding hop: which port a path leaves a switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub switch: SwitchId,
    pub port: PortId,
}

impl Hop {
    pub fn new(switch: SwitchId, port: PortId) -> Self {
        Self { switch, port }
    }
}

/// A switch with its own forwarding table and random source.
#[derive(Debug)]
pub struct Switch {
    id: SwitchId,
    table: ForwardingTable<PortId>,
    rng: ChaCha8Rng,
    forwarded: u64,
}

impl Switch {
    pub fn new(id: SwitchId, kind: SwitchKind, rng: ChaCha8Rng) -> Self {
        Self {
            id,
            table: ForwardingTable::new(kind),
            rng,
            forwarded: 0,
        }
    }

    pub fn id(&self) -> SwitchId {
        self.id
    }

    pub fn kind(&self) -> SwitchKind {
        self.table.kind()
    }

    pub fn table(&self) -> &ForwardingTable<PortId> {
        &self.table
    }

    pub fn add_entry(&mut self, flow: FlowKey, port: PortId, weight: f64) -> Result<()> {
        tracing::debug!(switch = %self.id, flow = %flow, port = %port, weight, "Adding entry to routing table");
        self.table.add_entry(flow, weight, port)
    }

    pub fn reconcile(&mut self) -> Result<()> {
        tracing::debug!(switch = %self.id, kind = %self.kind(), "Reconciling routing table");
        self.table.reconcile()
    }

    /// Pick the egress port for one packet of `flow`.
    pub fn forward(&mut self, flow: &FlowKey) -> Result<PortId> {
        let port = *self.table.forward(flow, &mut self.rng)?;
        self.forwarded += 1;
        tracing::trace!(switch = %self.id, flow = %flow, port = %port, "Forwarded packet");
        Ok(port)
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

/// All switches of a topology, indexed by id.
#[derive(Debug, Default)]
pub struct SwitchFabric {
    switches: BTreeMap<SwitchId, Switch>,
}

impl SwitchFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_switch(&mut self, switch: Switch) {
        self.switches.insert(switch.id(), switch);
    }

    pub fn switch(&self, id: SwitchId) -> Option<&Switch> {
        self.switches.get(&id)
    }

    fn switch_mut(&mut self, id: SwitchId) -> Result<&mut Switch> {
        self.switches
            .get_mut(&id)
            .ok_or_else(|| RoutingError::SwitchNotFound(id).into())
    }

    /// Install one path of `flow` with the path's weight at every hop.
    ///
    /// Paths sharing a switch accumulate choices there.
    pub fn install_path(&mut self, flow: FlowKey, hops: &[Hop], weight: f64) -> Result<()> {
        for hop in hops {
            self.switch_mut(hop.switch)?.add_entry(flow, hop.port, weight)?;
        }
        Ok(())
    }

    /// Reconcile every switch once all paths are installed.
    pub fn reconcile_all(&mut self) -> Result<()> {
        for switch in self.switches.values_mut() {
            switch.reconcile()?;
        }
        Ok(())
    }

    /// Forward one packet of `flow` arriving at switch `at`.
    pub fn forward(&mut self, at: SwitchId, flow: &FlowKey) -> Result<PortId> {
        self.switch_mut(at)?.forward(flow)
    }

    pub fn len(&self) -> usize {
        self.switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }
}
