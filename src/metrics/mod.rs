//! Per-unit transmission and delivery records.
//!
//! The engine calls a [`MetricsSink`] once when a unit leaves the sender and
//! once when the receiver releases it in order. It does not store or export
//! anything itself; [`MemorySink`] keeps records in memory for the scenario
//! runner and tests.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{FlowId, SequenceNumber};

/// One unit observed at the sender or the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub flow: FlowId,
    pub seq: SequenceNumber,
    /// Application payload size, excluding the sequence tag.
    pub size: usize,
    /// Time since the start of the run.
    pub at: Duration,
}

/// Hook invoked at transmission and delivery time.
pub trait MetricsSink: Send + Sync {
    fn on_transmit(&self, record: &UnitRecord);
    fn on_delivery(&self, record: &UnitRecord);
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn on_transmit(&self, _record: &UnitRecord) {}
    fn on_delivery(&self, _record: &UnitRecord) {}
}

/// Emits each record as a trace event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn on_transmit(&self, record: &UnitRecord) {
        tracing::trace!(
            flow = %record.flow,
            seq = record.seq.get(),
            size = record.size,
            at = ?record.at,
            "Unit transmitted"
        );
    }

    fn on_delivery(&self, record: &UnitRecord) {
        tracing::trace!(
            flow = %record.flow,
            seq = record.seq.get(),
            size = record.size,
            at = ?record.at,
            "Unit delivered"
        );
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    transmitted: Mutex<Vec<UnitRecord>>,
    delivered: Mutex<Vec<UnitRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transmitted(&self) -> Vec<UnitRecord> {
        self.transmitted.lock().clone()
    }

    pub fn delivered(&self) -> Vec<UnitRecord> {
        self.delivered.lock().clone()
    }

    /// Delivered sequence numbers of `flow`, in delivery order.
    pub fn delivery_order(&self, flow: FlowId) -> Vec<SequenceNumber> {
        self.delivered
            .lock()
            .iter()
            .filter(|r| r.flow == flow)
            .map(|r| r.seq)
            .collect()
    }

    /// Totals for one flow, pairing transmit and delivery records by sequence.
    pub fn summary(&self, flow: FlowId) -> FlowSummary {
        let sent: BTreeMap<SequenceNumber, Duration> = self
            .transmitted
            .lock()
            .iter()
            .filter(|r| r.flow == flow)
            .map(|r| (r.seq, r.at))
            .collect();

        let mut summary = FlowSummary {
            flow,
            transmitted: sent.len() as u64,
            ..FlowSummary::default()
        };
        let mut total_delay = Duration::ZERO;
        let mut matched = 0u32;

        for record in self.delivered.lock().iter().filter(|r| r.flow == flow) {
            summary.delivered += 1;
            summary.bytes_delivered += record.size as u64;
            summary.last_delivery = summary.last_delivery.max(record.at);
            if let Some(at) = sent.get(&record.seq) {
                let delay = record.at.saturating_sub(*at);
                summary.max_delay = summary.max_delay.max(delay);
                total_delay += delay;
                matched += 1;
            }
        }
        if matched > 0 {
            summary.mean_delay = Some(total_delay / matched);
        }
        summary
    }
}

impl MetricsSink for MemorySink {
    fn on_transmit(&self, record: &UnitRecord) {
        self.transmitted.lock().push(*record);
    }

    fn on_delivery(&self, record: &UnitRecord) {
        self.delivered.lock().push(*record);
    }
}

/// Per-flow totals computed by [`MemorySink::summary`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowSummary {
    pub flow: FlowId,
    pub transmitted: u64,
    pub delivered: u64,
    pub bytes_delivered: u64,
    pub mean_delay: Option<Duration>,
    pub max_delay: Duration,
    pub last_delivery: Duration,
}

impl FlowSummary {
    /// Delivered application bits per second over the span up to the last delivery.
    pub fn goodput_bps(&self) -> f64 {
        let secs = self.last_delivery.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_delivered * 8) as f64 / secs
        } else {
            0.0
        }
    }
}
