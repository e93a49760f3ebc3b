//! Receiver for one multipath flow.
//!
//! Bytes from each path go through that path's [`StreamDefragmenter`] when the
//! flow runs over a stream transport; datagrams are already whole units. Every
//! unit is untagged and handed to the flow's [`ReassemblyBuffer`].

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::flow::FlowSpec;
use super::reassembly::{DeliveredUnit, ReassemblyBuffer, ReassemblyConfig, ReassemblyStats};
use crate::error::{ProtocolError, Result};
use crate::metrics::{MetricsSink, NoopSink, UnitRecord};
use crate::protocol::{untag, StreamDefragmenter, SEQUENCE_TAG_SIZE};
use crate::types::{FlowId, FlowProtocol, PathId, SequenceNumber};
use crate::util::{Clock, MonotonicClock};

/// Reassembling receiver of one flow.
pub struct MultipathReceiver {
    flow: FlowId,
    protocol: FlowProtocol,
    unit_size: usize,
    paths: BTreeMap<PathId, StreamDefragmenter>,
    buffer: ReassemblyBuffer,
    sink: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl MultipathReceiver {
    /// `unit_size` is the tagged unit length on the wire; it frames stream
    /// transports and is ignored for datagrams.
    pub fn new(
        flow: FlowId,
        protocol: FlowProtocol,
        unit_size: usize,
        config: &ReassemblyConfig,
    ) -> Result<Self> {
        if protocol.is_stream() && unit_size <= SEQUENCE_TAG_SIZE {
            return Err(ProtocolError::InvalidUnitSize(unit_size).into());
        }
        Ok(Self {
            flow,
            protocol,
            unit_size,
            paths: BTreeMap::new(),
            buffer: ReassemblyBuffer::new(flow, config),
            sink: Arc::new(NoopSink),
            clock: Arc::new(MonotonicClock::new()),
        })
    }

    /// Receiver for `spec` with every path registered.
    pub fn for_flow(spec: &FlowSpec, config: &ReassemblyConfig) -> Result<Self> {
        let mut receiver = Self::new(spec.id, spec.protocol, spec.unit_size(), config)?;
        for path in &spec.paths {
            receiver.add_path(path.id);
        }
        Ok(receiver)
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn add_path(&mut self, path: PathId) {
        let capacity = if self.protocol.is_stream() { 2 * self.unit_size } else { 0 };
        self.paths
            .entry(path)
            .or_insert_with(|| StreamDefragmenter::with_capacity(capacity));
    }

    /// Process bytes (stream) or one datagram received on `path`.
    pub fn on_receive(&mut self, path: PathId, data: Bytes) -> Result<Vec<DeliveredUnit>> {
        let defrag = self.paths.get_mut(&path).ok_or(ProtocolError::UnknownPath {
            flow: self.flow,
            path,
        })?;

        let mut delivered = Vec::new();
        if self.protocol.is_stream() {
            defrag.feed(&data);
            for block in defrag.drain_units(self.unit_size) {
                let (seq, payload) = untag(block)?;
                delivered.extend(self.buffer.on_arrival(seq, payload)?);
            }
        } else {
            let (seq, payload) = untag(data)?;
            delivered.extend(self.buffer.on_arrival(seq, payload)?);
        }

        if !delivered.is_empty() {
            let at = self.clock.now();
            for unit in &delivered {
                self.sink.on_delivery(&UnitRecord {
                    flow: self.flow,
                    seq: unit.seq,
                    size: unit.size(),
                    at,
                });
            }
        }
        Ok(delivered)
    }

    /// Discard undelivered state; returns the number of units lost.
    pub fn teardown(self) -> usize {
        let partial: usize = self.paths.values().map(StreamDefragmenter::buffered).sum();
        if partial > 0 {
            warn!(flow = %self.flow, bytes = partial, "Discarding partial units on teardown");
        }
        let stats = self.buffer.stats();
        let lost = self.buffer.teardown();
        debug!(
            flow = %self.flow,
            delivered = stats.delivered,
            reordered = stats.reordered,
            lost,
            "Receiver torn down"
        );
        lost
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn protocol(&self) -> FlowProtocol {
        self.protocol
    }

    pub fn expected(&self) -> SequenceNumber {
        self.buffer.expected()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.buffered()
    }

    /// Bytes held by `path`'s defragmenter awaiting the rest of a unit.
    pub fn partial_bytes(&self, path: PathId) -> usize {
        self.paths.get(&path).map_or(0, StreamDefragmenter::buffered)
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.buffer.stats()
    }
}

impl std::fmt::Debug for MultipathReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipathReceiver")
            .field("flow", &self.flow)
            .field("protocol", &self.protocol)
            .field("unit_size", &self.unit_size)
            .field("paths", &self.paths.len())
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}
