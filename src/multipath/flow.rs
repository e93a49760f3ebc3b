//! Flow and path descriptions.
//!
//! A [`FlowSpec`] is what the topology source hands the engine for one
//! logical flow: its addresses, protocol and aggregate rate, and the paths its
//! traffic is split over. Everything the sender and receiver need at setup
//! (unit size, split ratios, send interval) is derived from it.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::SEQUENCE_TAG_SIZE;
use crate::types::{FlowId, FlowKey, FlowProtocol, PathId};
use crate::util::RATIO_EPSILON;

/// One logical flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSpec {
    pub id: FlowId,

    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,

    #[serde(default = "default_src_port")]
    pub src_port: u16,

    #[serde(default = "default_dst_port")]
    pub dst_port: u16,

    #[serde(default = "default_protocol")]
    pub protocol: FlowProtocol,

    /// Aggregate packet rate in bits per second, headers included.
    pub data_rate_bps: f64,

    /// Size of one packet on the wire, headers included.
    #[serde(default = "default_packet_size")]
    pub packet_size: u32,

    /// Largest write a stream transport accepts as one segment.
    #[serde(default)]
    pub max_segment_size: Option<u32>,

    #[serde(default)]
    pub paths: Vec<PathSpec>,
}

/// One path of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSpec {
    pub id: PathId,

    #[serde(default)]
    pub src_port: u16,

    #[serde(default)]
    pub dst_port: u16,

    /// Share of the flow rate carried by this path, in bits per second.
    pub data_rate_bps: f64,

    /// One-way propagation delay.
    #[serde(default = "default_delay", with = "humantime_serde")]
    pub delay: Duration,

    /// Maximum extra delay added uniformly per delivery.
    #[serde(default, with = "humantime_serde")]
    pub jitter: Duration,

    /// Send buffer of the path's channel in bytes.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

fn default_src_port() -> u16 { 49_153 }
fn default_dst_port() -> u16 { 9 }
fn default_protocol() -> FlowProtocol { FlowProtocol::Udp }
fn default_packet_size() -> u32 { 1_500 }
fn default_delay() -> Duration { Duration::from_millis(10) }
fn default_send_buffer() -> usize { 131_072 }

impl PathSpec {
    pub fn new(id: PathId, data_rate_bps: f64) -> Self {
        Self {
            id,
            src_port: 0,
            dst_port: 0,
            data_rate_bps,
            delay: default_delay(),
            jitter: Duration::ZERO,
            send_buffer: default_send_buffer(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_send_buffer(mut self, bytes: usize) -> Self {
        self.send_buffer = bytes;
        self
    }
}

impl FlowSpec {
    pub fn new(id: FlowId, protocol: FlowProtocol, data_rate_bps: f64) -> Self {
        Self {
            id,
            src_addr: Ipv4Addr::new(10, 1, 1, 1),
            dst_addr: Ipv4Addr::new(10, 2, 2, 2),
            src_port: default_src_port(),
            dst_port: default_dst_port(),
            protocol,
            data_rate_bps,
            packet_size: default_packet_size(),
            max_segment_size: None,
            paths: Vec::new(),
        }
    }

    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn with_path(mut self, path: PathSpec) -> Self {
        self.paths.push(path);
        self
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(
            self.src_addr,
            self.dst_addr,
            self.src_port,
            self.dst_port,
            self.protocol,
        )
    }

    /// Header bytes per packet: transport, IPv4, link and sequence tag.
    pub fn header_size(&self) -> u32 {
        self.protocol.header_overhead() + SEQUENCE_TAG_SIZE as u32
    }

    /// Application bytes carried by one packet.
    pub fn data_payload_size(&self) -> usize {
        self.packet_size.saturating_sub(self.header_size()) as usize
    }

    /// Size of one tagged unit as handed to a path's channel.
    pub fn unit_size(&self) -> usize {
        self.data_payload_size() + SEQUENCE_TAG_SIZE
    }

    /// A flow with no meaningful rate never opens channels or sends.
    pub fn is_zero_rate(&self) -> bool {
        self.data_rate_bps <= RATIO_EPSILON
    }

    /// Raw per-path weights: path rate over flow rate.
    ///
    /// Empty for a zero-rate flow.
    pub fn split_ratios(&self) -> Vec<(PathId, f64)> {
        if self.is_zero_rate() {
            return Vec::new();
        }
        self.paths
            .iter()
            .map(|p| (p.id, p.data_rate_bps / self.data_rate_bps))
            .collect()
    }

    /// Application-level rate once header overhead is removed.
    pub fn goodput_bps(&self) -> f64 {
        if self.packet_size == 0 {
            return 0.0;
        }
        self.data_rate_bps * self.data_payload_size() as f64 / f64::from(self.packet_size)
    }

    /// Time between two application sends, `None` for a zero-rate flow.
    pub fn transmission_interval(&self) -> Option<Duration> {
        if self.is_zero_rate() {
            return None;
        }
        let goodput = self.goodput_bps();
        let secs = (self.data_payload_size() * 8) as f64 / goodput;
        (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
    }

    pub fn path(&self, id: PathId) -> Option<&PathSpec> {
        self.paths.iter().find(|p| p.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> {
            Err(Error::InvalidConfig(format!("{}: {msg}", self.id)))
        };

        if !self.data_rate_bps.is_finite() || self.data_rate_bps < 0.0 {
            return invalid(format!("invalid data rate {}", self.data_rate_bps));
        }
        if self.packet_size <= self.header_size() {
            return invalid(format!(
                "packet size {} does not exceed header size {}",
                self.packet_size,
                self.header_size()
            ));
        }
        if let (true, Some(mss)) = (self.protocol.is_stream(), self.max_segment_size) {
            if self.unit_size() > mss as usize {
                return invalid(format!(
                    "unit of {} bytes exceeds segment size {mss}",
                    self.unit_size()
                ));
            }
        }

        let mut seen = BTreeSet::new();
        for path in &self.paths {
            if !seen.insert(path.id) {
                return invalid(format!("duplicate {}", path.id));
            }
            if !path.data_rate_bps.is_finite() || path.data_rate_bps < 0.0 {
                return invalid(format!("{} has invalid data rate {}", path.id, path.data_rate_bps));
            }
            if path.send_buffer < self.unit_size() {
                return invalid(format!(
                    "{} send buffer {} cannot hold a {}-byte unit",
                    path.id,
                    path.send_buffer,
                    self.unit_size()
                ));
            }
        }
        if !self.is_zero_rate() {
            if self.paths.is_empty() {
                return invalid("non-zero rate but no paths".into());
            }
            if self.paths.iter().all(|p| p.data_rate_bps == 0.0) {
                return invalid("non-zero rate but every path has rate 0".into());
            }
        }
        Ok(())
    }
}
