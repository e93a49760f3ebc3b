//! Core types used throughout mpflow.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Size of an IPv4 header without options.
pub const IPV4_HEADER_SIZE: u32 = 20;

/// Size of a point-to-point link header.
pub const PPP_HEADER_SIZE: u32 = 2;

/// TCP header plus the timestamp option block the simulated stack emits.
pub const TCP_HEADER_SIZE: u32 = 32;

/// UDP header size.
pub const UDP_HEADER_SIZE: u32 = 8;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u32> for $name {
            fn from(id: u32) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// Identifier of one logical flow.
    FlowId,
    "flow-"
);
numeric_id!(
    /// Identifier of one path of a flow.
    PathId,
    "path-"
);
numeric_id!(
    /// Egress port on a switch.
    PortId,
    "port-"
);
numeric_id!(
    /// Identifier of a switch in the fabric.
    SwitchId,
    "switch-"
);

/// Per-flow sequence number carried in the 8-byte unit tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const ZERO: Self = Self(0);

    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The following sequence number. Sequence numbers never wrap within a run.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    /// Reliable byte stream; the receiver must re-frame units.
    Tcp,
    /// Datagrams; every receive is one whole unit.
    Udp,
}

impl FlowProtocol {
    /// Whether the transport may coalesce or split application writes.
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Tcp)
    }

    /// Transport-layer header size in bytes.
    pub fn transport_header_size(self) -> u32 {
        match self {
            Self::Tcp => TCP_HEADER_SIZE,
            Self::Udp => UDP_HEADER_SIZE,
        }
    }

    /// Transport, network and link header bytes added to every packet.
    pub fn header_overhead(self) -> u32 {
        self.transport_header_size() + IPV4_HEADER_SIZE + PPP_HEADER_SIZE
    }
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Five-tuple identifying a flow in forwarding and split-ratio tables.
///
/// Equality, hashing and ordering use only the address/port quadruple, in
/// lexicographic order (src addr, dst addr, src port, dst port). The protocol
/// is carried along for diagnostics but does not distinguish table entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: FlowProtocol,
}

impl FlowKey {
    pub fn new(
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        protocol: FlowProtocol,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            protocol,
        }
    }

    fn ordering_key(&self) -> (Ipv4Addr, Ipv4Addr, u16, u16) {
        (self.src_addr, self.dst_addr, self.src_port, self.dst_port)
    }
}

impl PartialEq for FlowKey {
    fn eq(&self, other: &Self) -> bool {
        self.ordering_key() == other.ordering_key()
    }
}

impl Eq for FlowKey {}

impl PartialOrd for FlowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ordering_key().hash(state);
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}
