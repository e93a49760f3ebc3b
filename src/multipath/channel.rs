//! Transport channels carrying one path's units.
//!
//! The engine only touches a channel's framing surface: open it, ask how many
//! bytes it can take, push a unit, close it. Retransmission and congestion
//! control belong to whatever implements [`TransportChannel`].

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{ChannelError, ChannelErrorKind};

/// Send half of one path.
pub trait TransportChannel: Send {
    /// Establish the channel. Called once when the sender starts.
    fn open(&mut self) -> std::result::Result<(), ChannelError>;

    /// Bytes the channel can accept right now.
    fn available_capacity(&self) -> usize;

    /// Push one tagged unit, returning how many bytes were accepted.
    fn send(&mut self, unit: Bytes) -> std::result::Result<usize, ChannelError>;

    /// Release the channel.
    fn close(&mut self);
}

impl<C: TransportChannel + ?Sized> TransportChannel for Box<C> {
    fn open(&mut self) -> std::result::Result<(), ChannelError> {
        (**self).open()
    }

    fn available_capacity(&self) -> usize {
        (**self).available_capacity()
    }

    fn send(&mut self, unit: Bytes) -> std::result::Result<usize, ChannelError> {
        (**self).send(unit)
    }

    fn close(&mut self) {
        (**self).close();
    }
}

#[derive(Debug)]
struct LinkState {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    capacity: usize,
    opened: bool,
    closed: bool,
    open_calls: u32,
    units_sent: u64,
    accept_limit: Option<usize>,
    fail_next: Option<ChannelError>,
}

/// In-process channel backed by a bounded byte queue.
///
/// Capacity is the send buffer size minus the bytes not yet taken by the
/// [`MemoryLink`] at the other end.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    state: Arc<Mutex<LinkState>>,
}

/// Receiving end of a [`MemoryChannel`].
#[derive(Debug, Clone)]
pub struct MemoryLink {
    state: Arc<Mutex<LinkState>>,
}

impl MemoryChannel {
    /// Create a channel with a `capacity`-byte send buffer and its receiving end.
    pub fn pair(capacity: usize) -> (Self, MemoryLink) {
        let state = Arc::new(Mutex::new(LinkState {
            queue: VecDeque::new(),
            queued_bytes: 0,
            capacity,
            opened: false,
            closed: false,
            open_calls: 0,
            units_sent: 0,
            accept_limit: None,
            fail_next: None,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            MemoryLink { state },
        )
    }
}

impl TransportChannel for MemoryChannel {
    fn open(&mut self) -> std::result::Result<(), ChannelError> {
        let mut state = self.state.lock();
        state.open_calls += 1;
        if state.opened {
            return Err(ChannelError::new(
                ChannelErrorKind::AlreadyConnected,
                "channel already open",
            ));
        }
        state.opened = true;
        Ok(())
    }

    fn available_capacity(&self) -> usize {
        let state = self.state.lock();
        if !state.opened || state.closed {
            return 0;
        }
        state.capacity.saturating_sub(state.queued_bytes)
    }

    fn send(&mut self, unit: Bytes) -> std::result::Result<usize, ChannelError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if state.closed {
            return Err(ChannelError::new(ChannelErrorKind::Shutdown, "channel closed"));
        }
        if !state.opened {
            return Err(ChannelError::new(ChannelErrorKind::NotConnected, "channel not open"));
        }
        let free = state.capacity.saturating_sub(state.queued_bytes);
        if unit.len() > state.capacity {
            return Err(ChannelError::new(
                ChannelErrorKind::MessageTooLarge,
                format!("{} bytes exceed buffer of {}", unit.len(), state.capacity),
            ));
        }
        if unit.len() > free {
            return Err(ChannelError::new(
                ChannelErrorKind::WouldBlock,
                format!("{} bytes free, {} requested", free, unit.len()),
            ));
        }

        let accepted = state.accept_limit.map_or(unit.len(), |limit| limit.min(unit.len()));
        state.queued_bytes += accepted;
        state.units_sent += 1;
        state.queue.push_back(unit.slice(..accepted));
        Ok(accepted)
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }
}

impl MemoryLink {
    /// Take the oldest unit as it was sent.
    pub fn pop(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        let unit = state.queue.pop_front()?;
        state.queued_bytes -= unit.len();
        Some(unit)
    }

    /// Take up to `max` bytes, ignoring unit boundaries, as a byte stream would.
    pub fn take(&self, max: usize) -> Option<Bytes> {
        let mut state = self.state.lock();
        if state.queue.is_empty() || max == 0 {
            return None;
        }
        let mut out = BytesMut::with_capacity(max.min(state.queued_bytes));
        while out.len() < max {
            let Some(front) = state.queue.front_mut() else {
                break;
            };
            let want = max - out.len();
            if front.len() <= want {
                out.extend_from_slice(front);
                state.queue.pop_front();
            } else {
                out.extend_from_slice(&front.split_to(want));
            }
        }
        state.queued_bytes -= out.len();
        Some(out.freeze())
    }

    pub fn queued_units(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.state.lock().queued_bytes
    }

    pub fn is_opened(&self) -> bool {
        self.state.lock().opened
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// How many times the sender called `open`.
    pub fn open_calls(&self) -> u32 {
        self.state.lock().open_calls
    }

    pub fn units_sent(&self) -> u64 {
        self.state.lock().units_sent
    }

    /// Make the next send fail with `err`.
    pub fn fail_next_send(&self, err: ChannelError) {
        self.state.lock().fail_next = Some(err);
    }

    /// Accept at most `limit` bytes of each following send.
    pub fn set_accept_limit(&self, limit: Option<usize>) {
        self.state.lock().accept_limit = limit;
    }
}
