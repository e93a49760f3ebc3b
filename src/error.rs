//! Error types for mpflow.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::types::{FlowId, FlowKey, PathId, SequenceNumber, SwitchId};

/// Result type alias for mpflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mpflow.
#[derive(Error, Debug)]
pub enum Error {
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Split-ratio and forwarding table errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("routing table miss for flow {flow}")]
    TableMiss { flow: FlowKey },

    #[error("flow {flow} has no forwarding choices left after reconciliation")]
    NoChoices { flow: FlowKey },

    #[error("final split ratio for flow {flow} is {cumulative}, not 1")]
    NotNormalized { flow: FlowKey, cumulative: f64 },

    #[error("invalid weight {weight} for flow {flow}")]
    InvalidWeight { flow: FlowKey, weight: f64 },

    #[error("random draw {0} outside [0, 1]")]
    InvalidDraw(f64),

    #[error("split ratio table has not been reconciled")]
    NotReconciled,

    #[error("split ratio table was already reconciled")]
    AlreadyReconciled,

    #[error("duplicate forwarding entry for flow {flow}")]
    DuplicateEntry { flow: FlowKey },

    #[error("switch {0} not found")]
    SwitchNotFound(SwitchId),
}

/// Unit framing and resequencing violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed unit: {len} bytes, need at least {min}")]
    MalformedUnit { len: usize, min: usize },

    #[error("unit size {0} cannot hold a sequence tag")]
    InvalidUnitSize(usize),

    #[error("unit payload is {got} bytes, framing expects {expected}")]
    UnitLengthMismatch { expected: usize, got: usize },

    #[error("flow {flow}: sequence {seq} already delivered (expected {expected})")]
    LateDuplicate {
        flow: FlowId,
        seq: SequenceNumber,
        expected: SequenceNumber,
    },

    #[error("flow {flow}: sequence {seq} already buffered")]
    DuplicateSequence { flow: FlowId, seq: SequenceNumber },

    #[error("flow {flow}: sequence {seq} seen with size {got}, first seen with {first}")]
    SizeMismatch {
        flow: FlowId,
        seq: SequenceNumber,
        first: usize,
        got: usize,
    },

    #[error("flow {flow}: data from unknown {path}")]
    UnknownPath { flow: FlowId, path: PathId },
}

/// Failure kinds a transport channel can report, mirroring socket errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    NotConnected,
    AlreadyConnected,
    MessageTooLarge,
    WouldBlock,
    Shutdown,
    NotSupported,
    Invalid,
    NoRouteToHost,
    AddressInUse,
    Other,
}

impl fmt::Display for ChannelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotConnected => "ERROR_NOTCONN",
            Self::AlreadyConnected => "ERROR_ISCONN",
            Self::MessageTooLarge => "ERROR_MSGSIZE",
            Self::WouldBlock => "ERROR_AGAIN",
            Self::Shutdown => "ERROR_SHUTDOWN",
            Self::NotSupported => "ERROR_OPNOTSUPP",
            Self::Invalid => "ERROR_INVAL",
            Self::NoRouteToHost => "ERROR_NOROUTETOHOST",
            Self::AddressInUse => "ERROR_ADDRINUSE",
            Self::Other => "ERROR_OTHER",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`TransportChannel`](crate::multipath::TransportChannel).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub message: String,
}

impl ChannelError {
    pub fn new(kind: ChannelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Transport layer errors, with the context needed to diagnose a failed send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("flow {flow} unit {seq} ({size} bytes) failed to transmit on {path}: {source}")]
    SendFailed {
        flow: FlowId,
        path: PathId,
        seq: SequenceNumber,
        size: usize,
        source: ChannelError,
    },

    #[error("flow {flow} unit {seq} on {path}: channel accepted {accepted} of {size} bytes")]
    ShortWrite {
        flow: FlowId,
        path: PathId,
        seq: SequenceNumber,
        size: usize,
        accepted: usize,
    },

    #[error("flow {flow}: failed to open {path}: {source}")]
    OpenFailed {
        flow: FlowId,
        path: PathId,
        source: ChannelError,
    },

    #[error("flow {flow}: no channel for {path}")]
    UnknownPath { flow: FlowId, path: PathId },

    #[error("event channel closed")]
    EventChannelClosed,
}

/// Sender state machine misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("flow {flow}: {operation} not valid in state {state}")]
    InvalidState {
        flow: FlowId,
        operation: &'static str,
        state: String,
    },

    #[error("flow {flow}: duplicate {path}")]
    DuplicatePath { flow: FlowId, path: PathId },
}

impl Error {
    /// Whether the error halts the flow it was raised on.
    ///
    /// Every condition the engine itself detects is fatal; only setup-level
    /// errors (configuration files, IO) are reported without that meaning.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Config(_) | Error::InvalidConfig(_) | Error::Io(_)
        )
    }

    /// The flow the error was raised on, when known.
    pub fn flow(&self) -> Option<FlowId> {
        match self {
            Error::Protocol(
                ProtocolError::LateDuplicate { flow, .. }
                | ProtocolError::DuplicateSequence { flow, .. }
                | ProtocolError::SizeMismatch { flow, .. }
                | ProtocolError::UnknownPath { flow, .. },
            ) => Some(*flow),
            Error::Transport(
                TransportError::SendFailed { flow, .. }
                | TransportError::ShortWrite { flow, .. }
                | TransportError::OpenFailed { flow, .. }
                | TransportError::UnknownPath { flow, .. },
            ) => Some(*flow),
            Error::Scheduler(
                SchedulerError::InvalidState { flow, .. } | SchedulerError::DuplicatePath { flow, .. },
            ) => Some(*flow),
            _ => None,
        }
    }
}
