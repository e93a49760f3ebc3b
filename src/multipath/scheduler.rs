//! Sender-side path scheduling.
//!
//! A [`PathScheduler`] owns one flow's send state: the split-ratio table over
//! its paths, one channel per path, the sequence counter and a private random
//! source. Each application send draws once, picks a path and either
//! transmits immediately or parks the unit in that path's deferred queue until
//! the channel reports capacity again.
//!
//! Sequence numbers are assigned when a unit is handed to a channel, not when
//! the application submits it.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::channel::TransportChannel;
use super::flow::{FlowSpec, PathSpec};
use crate::error::{Result, SchedulerError, TransportError};
use crate::metrics::{MetricsSink, NoopSink, UnitRecord};
use crate::protocol::{tag, tagged_len};
use crate::routing::SplitRatioTable;
use crate::types::{FlowId, FlowKey, PathId, SequenceNumber};
use crate::util::{Clock, DrawSource, MonotonicClock};

/// What happens to deferred units when the flow is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Drop every deferred unit on stop.
    #[default]
    Discard,
    /// Keep sending deferred units as capacity returns until close.
    Flush,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub drain_policy: DrainPolicy,
}

/// Lifecycle of a flow's sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    /// Constructed, channels not opened.
    Idle,
    /// Accepting application sends.
    Active,
    /// Stopped; only deferred units may still leave.
    Draining,
    /// Channels released.
    Closed,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Result of one application send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the channel of `path` under `seq`.
    Sent { path: PathId, seq: SequenceNumber },
    /// Parked behind `queued` units (itself included) on `path`.
    Deferred { path: PathId, queued: usize },
    /// The flow has no rate; nothing was selected or sent.
    Inert,
}

/// Scheduler statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub units_sent: u64,
    pub bytes_sent: u64,
    pub units_deferred: u64,
    pub units_discarded: u64,
    pub bytes_discarded: u64,
    pub inert_sends: u64,
}

struct PathSlot<C> {
    channel: C,
    deferred: VecDeque<Bytes>,
    units_sent: u64,
}

/// Per-flow sender.
pub struct PathScheduler<C, D = ChaCha8Rng> {
    flow: FlowId,
    key: FlowKey,
    config: SchedulerConfig,
    state: SchedulerState,
    table: SplitRatioTable<PathId>,
    paths: BTreeMap<PathId, PathSlot<C>>,
    next_seq: SequenceNumber,
    draws: D,
    zero_rate: bool,
    inert: bool,
    sink: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    stats: SchedulerStats,
}

impl<C: TransportChannel, D: DrawSource> PathScheduler<C, D> {
    pub fn new(flow: FlowId, key: FlowKey, config: SchedulerConfig, draws: D) -> Self {
        Self {
            flow,
            key,
            config,
            state: SchedulerState::Idle,
            table: SplitRatioTable::new(),
            paths: BTreeMap::new(),
            next_seq: SequenceNumber::ZERO,
            draws,
            zero_rate: false,
            inert: false,
            sink: Arc::new(NoopSink),
            clock: Arc::new(MonotonicClock::new()),
            stats: SchedulerStats::default(),
        }
    }

    /// Build a scheduler for `spec`, creating one channel per path.
    pub fn for_flow<F>(spec: &FlowSpec, config: SchedulerConfig, draws: D, mut channel: F) -> Result<Self>
    where
        F: FnMut(&PathSpec) -> C,
    {
        let mut scheduler =
            Self::new(spec.id, spec.key(), config, draws).with_zero_rate(spec.is_zero_rate());
        let ratios: BTreeMap<PathId, f64> = spec.split_ratios().into_iter().collect();
        for path in &spec.paths {
            let weight = ratios.get(&path.id).copied().unwrap_or(0.0);
            scheduler.add_path(path.id, weight, channel(path))?;
        }
        Ok(scheduler)
    }

    /// Mark the flow as having no aggregate rate.
    pub fn with_zero_rate(mut self, zero_rate: bool) -> Self {
        self.zero_rate = zero_rate;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a path with its raw weight.
    pub fn add_path(&mut self, path: PathId, weight: f64, channel: C) -> Result<()> {
        self.require(&[SchedulerState::Idle], "add_path")?;
        if self.paths.contains_key(&path) {
            return Err(SchedulerError::DuplicatePath {
                flow: self.flow,
                path,
            }
            .into());
        }
        self.table.add_choice(self.key, weight, path)?;
        self.paths.insert(
            path,
            PathSlot {
                channel,
                deferred: VecDeque::new(),
                units_sent: 0,
            },
        );
        Ok(())
    }

    /// Reconcile split ratios and open every channel.
    ///
    /// A zero-rate flow becomes inert: no channel is opened and sends are
    /// accepted without effect. Any other flow whose paths all weigh 0 starts
    /// normally and fails its first send with [`RoutingError::NoChoices`](crate::error::RoutingError::NoChoices).
    pub fn start(&mut self) -> Result<()> {
        self.require(&[SchedulerState::Idle], "start")?;

        if self.zero_rate {
            info!(flow = %self.flow, key = %self.key, "Zero-rate flow, no channels opened");
            self.inert = true;
            self.state = SchedulerState::Active;
            return Ok(());
        }

        self.table.reconcile()?;
        let flow = self.flow;
        for (id, slot) in &mut self.paths {
            slot.channel
                .open()
                .map_err(|source| TransportError::OpenFailed {
                    flow,
                    path: *id,
                    source,
                })?;
        }

        debug!(
            flow = %self.flow,
            key = %self.key,
            paths = self.paths.len(),
            "Scheduler started"
        );
        self.state = SchedulerState::Active;
        Ok(())
    }

    /// Submit one application unit.
    pub fn send(&mut self, payload: Bytes) -> Result<SendOutcome> {
        self.require(&[SchedulerState::Active], "send")?;

        if self.inert {
            self.stats.inert_sends += 1;
            return Ok(SendOutcome::Inert);
        }

        let draw = self.draws.next_draw();
        let path = *self.table.select(&self.key, draw)?;
        let slot = self
            .paths
            .get_mut(&path)
            .ok_or(TransportError::UnknownPath {
                flow: self.flow,
                path,
            })?;

        if !slot.deferred.is_empty() || slot.channel.available_capacity() < tagged_len(payload.len()) {
            slot.deferred.push_back(payload);
            self.stats.units_deferred += 1;
            let queued = slot.deferred.len();
            trace!(flow = %self.flow, path = %path, queued, "Unit deferred");
            return Ok(SendOutcome::Deferred { path, queued });
        }

        let seq = self.transmit(path, payload)?;
        Ok(SendOutcome::Sent { path, seq })
    }

    /// Retry deferred units on `path` after its channel freed capacity.
    ///
    /// Returns how many units left the queue.
    pub fn on_capacity_available(&mut self, path: PathId) -> Result<usize> {
        self.require(&[SchedulerState::Active, SchedulerState::Draining], "on_capacity_available")?;
        if !self.paths.contains_key(&path) {
            return Err(TransportError::UnknownPath {
                flow: self.flow,
                path,
            }
            .into());
        }
        self.flush_path(path)
    }

    /// Stop accepting application sends.
    ///
    /// Under [`DrainPolicy::Discard`] the deferred queues are dropped and the
    /// count returned; under [`DrainPolicy::Flush`] they are retried now and
    /// whatever does not fit stays queued.
    pub fn stop(&mut self) -> Result<usize> {
        self.require(&[SchedulerState::Active], "stop")?;
        self.state = SchedulerState::Draining;

        match self.config.drain_policy {
            DrainPolicy::Discard => Ok(self.discard_deferred("stop")),
            DrainPolicy::Flush => {
                let ids: Vec<PathId> = self.paths.keys().copied().collect();
                for id in ids {
                    self.flush_path(id)?;
                }
                Ok(0)
            }
        }
    }

    /// Release every channel. Remaining deferred units are discarded.
    pub fn close(&mut self) -> Result<usize> {
        self.require(
            &[SchedulerState::Idle, SchedulerState::Active, SchedulerState::Draining],
            "close",
        )?;
        let discarded = self.discard_deferred("close");
        let opened = self.state != SchedulerState::Idle && !self.inert;
        if opened {
            for slot in self.paths.values_mut() {
                slot.channel.close();
            }
        }
        self.state = SchedulerState::Closed;
        debug!(flow = %self.flow, sent = self.stats.units_sent, "Scheduler closed");
        Ok(discarded)
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_inert(&self) -> bool {
        self.inert
    }

    /// Sequence number the next transmitted unit will carry.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_seq
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn table(&self) -> &SplitRatioTable<PathId> {
        &self.table
    }

    pub fn path_ids(&self) -> impl Iterator<Item = PathId> + '_ {
        self.paths.keys().copied()
    }

    /// Units waiting on `path`.
    pub fn deferred(&self, path: PathId) -> usize {
        self.paths.get(&path).map_or(0, |s| s.deferred.len())
    }

    pub fn total_deferred(&self) -> usize {
        self.paths.values().map(|s| s.deferred.len()).sum()
    }

    /// Units transmitted on `path`.
    pub fn sent_on(&self, path: PathId) -> u64 {
        self.paths.get(&path).map_or(0, |s| s.units_sent)
    }

    pub fn channel(&self, path: PathId) -> Option<&C> {
        self.paths.get(&path).map(|s| &s.channel)
    }

    pub fn draws(&self) -> &D {
        &self.draws
    }

    fn require(&self, allowed: &[SchedulerState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidState {
                flow: self.flow,
                operation,
                state: self.state.to_string(),
            }
            .into())
        }
    }

    fn flush_path(&mut self, path: PathId) -> Result<usize> {
        let mut flushed = 0;
        loop {
            let Some(slot) = self.paths.get_mut(&path) else {
                break;
            };
            let fits = slot
                .deferred
                .front()
                .is_some_and(|p| slot.channel.available_capacity() >= tagged_len(p.len()));
            if !fits {
                break;
            }
            let Some(payload) = slot.deferred.pop_front() else {
                break;
            };
            self.transmit(path, payload)?;
            flushed += 1;
        }
        if flushed > 0 {
            trace!(flow = %self.flow, path = %path, flushed, "Deferred units flushed");
        }
        Ok(flushed)
    }

    fn transmit(&mut self, path: PathId, payload: Bytes) -> Result<SequenceNumber> {
        let flow = self.flow;
        let slot = self
            .paths
            .get_mut(&path)
            .ok_or(TransportError::UnknownPath { flow, path })?;

        let seq = self.next_seq;
        let unit = tag(seq, &payload);
        let size = unit.len();
        let accepted = slot
            .channel
            .send(unit)
            .map_err(|source| TransportError::SendFailed {
                flow,
                path,
                seq,
                size,
                source,
            })?;
        if accepted != size {
            return Err(TransportError::ShortWrite {
                flow,
                path,
                seq,
                size,
                accepted,
            }
            .into());
        }

        slot.units_sent += 1;
        self.next_seq = seq.next();
        self.stats.units_sent += 1;
        self.stats.bytes_sent += size as u64;
        self.sink.on_transmit(&UnitRecord {
            flow,
            seq,
            size: payload.len(),
            at: self.clock.now(),
        });
        trace!(flow = %flow, path = %path, seq = seq.get(), size, "Unit transmitted");
        Ok(seq)
    }

    fn discard_deferred(&mut self, reason: &'static str) -> usize {
        let mut units = 0;
        let mut bytes = 0u64;
        for slot in self.paths.values_mut() {
            units += slot.deferred.len();
            bytes += slot.deferred.drain(..).map(|p| p.len() as u64).sum::<u64>();
        }
        if units > 0 {
            warn!(flow = %self.flow, units, bytes, reason, "Discarding deferred units");
        }
        self.stats.units_discarded += units as u64;
        self.stats.bytes_discarded += bytes;
        units
    }
}

impl<C, D> fmt::Debug for PathScheduler<C, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathScheduler")
            .field("flow", &self.flow)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("paths", &self.paths.len())
            .field("next_seq", &self.next_seq)
            .field("inert", &self.inert)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
