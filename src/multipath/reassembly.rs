//! In-order delivery of units arriving over several paths.
//!
//! The buffer keeps the next expected sequence number and a min-ordered map of
//! units that arrived early. A unit equal to the cursor is released at once,
//! followed by every buffered unit that was only waiting for it.
//!
//! The sizes of the most recently delivered units are kept for a configurable
//! window, so a late repeat carrying a different size is caught as a size
//! mismatch rather than treated as a plain duplicate.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{ProtocolError, Result};
use crate::types::{FlowId, SequenceNumber};

/// Handling of a sequence number seen twice with the same size.
///
/// A repeat with a different size is always rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Fail the flow.
    #[default]
    Fatal,
    /// Drop the repeat, log it and count it.
    LogAndDrop,
}

/// Default number of delivered unit sizes kept for auditing late repeats.
pub const DEFAULT_AUDIT_WINDOW: usize = 65_536;

/// Reassembly configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassemblyConfig {
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Delivered units whose size is remembered. Repeats older than this are
    /// judged by the duplicate policy alone.
    #[serde(default = "default_audit_window")]
    pub audit_window: usize,
}

fn default_audit_window() -> usize {
    DEFAULT_AUDIT_WINDOW
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            audit_window: default_audit_window(),
        }
    }
}

/// A unit released to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredUnit {
    pub seq: SequenceNumber,
    pub payload: Bytes,
}

impl DeliveredUnit {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Reassembly statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    pub delivered: u64,
    pub bytes_delivered: u64,
    /// Arrivals that had to wait for an earlier unit.
    pub reordered: u64,
    pub peak_buffered: usize,
    pub duplicates_dropped: u64,
}

/// Per-flow resequencer.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    flow: FlowId,
    expected: SequenceNumber,
    pending: BTreeMap<SequenceNumber, Bytes>,
    /// Sizes of the last delivered units, oldest first; the back is `expected - 1`.
    delivered_sizes: VecDeque<usize>,
    audit_window: usize,
    policy: DuplicatePolicy,
    stats: ReassemblyStats,
}

impl ReassemblyBuffer {
    pub fn new(flow: FlowId, config: &ReassemblyConfig) -> Self {
        Self {
            flow,
            expected: SequenceNumber::ZERO,
            pending: BTreeMap::new(),
            delivered_sizes: VecDeque::new(),
            audit_window: config.audit_window,
            policy: config.duplicate_policy,
            stats: ReassemblyStats::default(),
        }
    }

    /// Accept one unit and return whatever became deliverable, in order.
    pub fn on_arrival(&mut self, seq: SequenceNumber, payload: Bytes) -> Result<Vec<DeliveredUnit>> {
        if seq < self.expected {
            if let Some(first) = self.delivered_size(seq) {
                if first != payload.len() {
                    return Err(ProtocolError::SizeMismatch {
                        flow: self.flow,
                        seq,
                        first,
                        got: payload.len(),
                    }
                    .into());
                }
            }
            return self.duplicate(
                seq,
                ProtocolError::LateDuplicate {
                    flow: self.flow,
                    seq,
                    expected: self.expected,
                },
            );
        }

        if seq > self.expected {
            match self.pending.entry(seq) {
                Entry::Vacant(slot) => {
                    slot.insert(payload);
                    self.stats.reordered += 1;
                    self.stats.peak_buffered = self.stats.peak_buffered.max(self.pending.len());
                    trace!(
                        flow = %self.flow,
                        seq = seq.get(),
                        expected = self.expected.get(),
                        buffered = self.pending.len(),
                        "Unit buffered"
                    );
                    return Ok(Vec::new());
                }
                Entry::Occupied(slot) => {
                    let first = slot.get().len();
                    if first != payload.len() {
                        return Err(ProtocolError::SizeMismatch {
                            flow: self.flow,
                            seq,
                            first,
                            got: payload.len(),
                        }
                        .into());
                    }
                    return self.duplicate(seq, ProtocolError::DuplicateSequence { flow: self.flow, seq });
                }
            }
        }

        let mut delivered = vec![self.release(seq, payload)];
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.expected {
                break;
            }
            let (seq, payload) = entry.remove_entry();
            delivered.push(self.release(seq, payload));
        }
        Ok(delivered)
    }

    fn release(&mut self, seq: SequenceNumber, payload: Bytes) -> DeliveredUnit {
        self.expected = seq.next();
        self.stats.delivered += 1;
        self.stats.bytes_delivered += payload.len() as u64;
        if self.audit_window > 0 {
            if self.delivered_sizes.len() == self.audit_window {
                self.delivered_sizes.pop_front();
            }
            self.delivered_sizes.push_back(payload.len());
        }
        DeliveredUnit { seq, payload }
    }

    /// Size `seq` was delivered with, if it is still inside the audit window.
    fn delivered_size(&self, seq: SequenceNumber) -> Option<usize> {
        let back = usize::try_from(self.expected.get() - seq.get()).ok()?;
        let index = self.delivered_sizes.len().checked_sub(back)?;
        self.delivered_sizes.get(index).copied()
    }

    fn duplicate(&mut self, seq: SequenceNumber, err: ProtocolError) -> Result<Vec<DeliveredUnit>> {
        match self.policy {
            DuplicatePolicy::Fatal => Err(err.into()),
            DuplicatePolicy::LogAndDrop => {
                warn!(flow = %self.flow, seq = seq.get(), "{err}, dropping");
                self.stats.duplicates_dropped += 1;
                Ok(Vec::new())
            }
        }
    }

    /// Drop everything still buffered and return how many units were lost.
    pub fn teardown(self) -> usize {
        let lost = self.pending.len();
        if lost > 0 {
            warn!(
                flow = %self.flow,
                lost,
                expected = self.expected.get(),
                first_buffered = self.pending.keys().next().map(|s| s.get()),
                "Discarding undelivered units on teardown"
            );
        }
        lost
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    /// The next sequence number the application will receive.
    pub fn expected(&self) -> SequenceNumber {
        self.expected
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn buffered_sequences(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        self.pending.keys().copied()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn buffer() -> ReassemblyBuffer {
        ReassemblyBuffer::new(FlowId::new(1), &ReassemblyConfig::default())
    }

    fn lenient() -> ReassemblyBuffer {
        ReassemblyBuffer::new(
            FlowId::new(1),
            &ReassemblyConfig {
                duplicate_policy: DuplicatePolicy::LogAndDrop,
                ..Default::default()
            },
        )
    }

    fn unit(size: usize) -> Bytes {
        Bytes::from(vec![0xAB; size])
    }

    fn arrive(buf: &mut ReassemblyBuffer, seq: u64) -> Vec<u64> {
        buf.on_arrival(SequenceNumber::new(seq), unit(10))
            .unwrap()
            .into_iter()
            .map(|u| u.seq.get())
            .collect()
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut buf = buffer();
        let mut order = Vec::new();
        for seq in [2, 0, 4, 1, 3] {
            order.extend(arrive(&mut buf, seq));
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(buf.is_empty());
        assert_eq!(buf.expected(), SequenceNumber::new(5));

        let stats = buf.stats();
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.reordered, 2);
        assert_eq!(stats.peak_buffered, 2);
    }

    #[test]
    fn test_drain_releases_contiguous_run_only() {
        let mut buf = buffer();
        assert!(arrive(&mut buf, 1).is_empty());
        assert!(arrive(&mut buf, 2).is_empty());
        assert!(arrive(&mut buf, 4).is_empty());
        assert_eq!(arrive(&mut buf, 0), vec![0, 1, 2]);
        assert_eq!(buf.buffered_sequences().collect::<Vec<_>>(), vec![SequenceNumber::new(4)]);
        assert_eq!(arrive(&mut buf, 3), vec![3, 4]);
    }

    #[test]
    fn test_late_duplicate_is_fatal() {
        let mut buf = buffer();
        for seq in 0..=5 {
            arrive(&mut buf, seq);
        }
        let err = buf.on_arrival(SequenceNumber::new(5), unit(10)).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::LateDuplicate { seq, expected, .. })
                if seq.get() == 5 && expected.get() == 6
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_buffered_duplicate_is_fatal() {
        let mut buf = buffer();
        arrive(&mut buf, 3);
        let err = buf.on_arrival(SequenceNumber::new(3), unit(10)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::DuplicateSequence { .. })));
    }

    #[test]
    fn test_size_mismatch_is_fatal_under_any_policy() {
        for mut buf in [buffer(), lenient()] {
            buf.on_arrival(SequenceNumber::new(7), unit(100)).unwrap();
            let err = buf.on_arrival(SequenceNumber::new(7), unit(200)).unwrap_err();
            assert!(matches!(
                err,
                Error::Protocol(ProtocolError::SizeMismatch { first: 100, got: 200, .. })
            ));
        }
    }

    #[test]
    fn test_late_repeat_with_other_size_is_fatal_under_any_policy() {
        for mut buf in [buffer(), lenient()] {
            buf.on_arrival(SequenceNumber::new(0), unit(100)).unwrap();
            buf.on_arrival(SequenceNumber::new(1), unit(100)).unwrap();
            let err = buf.on_arrival(SequenceNumber::new(0), unit(200)).unwrap_err();
            assert!(matches!(
                err,
                Error::Protocol(ProtocolError::SizeMismatch { seq, first: 100, got: 200, .. })
                    if seq.get() == 0
            ));
        }
    }

    #[test]
    fn test_audit_window_bounds_size_record() {
        let mut buf = ReassemblyBuffer::new(
            FlowId::new(1),
            &ReassemblyConfig {
                duplicate_policy: DuplicatePolicy::LogAndDrop,
                audit_window: 2,
            },
        );
        for seq in 0..4 {
            arrive(&mut buf, seq);
        }
        // 0 and 1 fell out of the window; only the policy applies to them.
        assert!(buf.on_arrival(SequenceNumber::new(1), unit(99)).unwrap().is_empty());
        assert!(matches!(
            buf.on_arrival(SequenceNumber::new(2), unit(99)),
            Err(Error::Protocol(ProtocolError::SizeMismatch { first: 10, got: 99, .. }))
        ));
        assert_eq!(buf.stats().duplicates_dropped, 1);
    }

    #[test]
    fn test_log_and_drop_policy() {
        let mut buf = lenient();
        arrive(&mut buf, 0);
        assert!(arrive(&mut buf, 0).is_empty());
        arrive(&mut buf, 2);
        assert!(arrive(&mut buf, 2).is_empty());
        assert_eq!(buf.stats().duplicates_dropped, 2);
        assert_eq!(arrive(&mut buf, 1), vec![1, 2]);
    }

    #[test]
    fn test_teardown_reports_lost_units() {
        let mut buf = buffer();
        arrive(&mut buf, 0);
        arrive(&mut buf, 2);
        arrive(&mut buf, 3);
        assert_eq!(buf.teardown(), 2);
    }

    #[test]
    fn test_payload_passes_through() {
        let mut buf = buffer();
        buf.on_arrival(SequenceNumber::new(1), Bytes::from_static(b"second")).unwrap();
        let out = buf.on_arrival(SequenceNumber::new(0), Bytes::from_static(b"first")).unwrap();
        assert_eq!(&out[0].payload[..], b"first");
        assert_eq!(&out[1].payload[..], b"second");
        assert_eq!(out[1].size(), 6);
        assert_eq!(buf.stats().bytes_delivered, 11);
    }
}
