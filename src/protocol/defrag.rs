//! Re-framing of byte-stream transports.
//!
//! A stream transport may coalesce or split the writes of the sender
//! arbitrarily. The defragmenter accumulates whatever arrives and cuts it into
//! fixed-size units again; a trailing partial unit stays buffered until the
//! next feed completes it.

use bytes::{Bytes, BytesMut};

/// Append-only accumulator that emits fixed-size blocks.
#[derive(Debug, Default)]
pub struct StreamDefragmenter {
    buffer: BytesMut,
}

impl StreamDefragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Cut every complete `unit_size` block off the front of the accumulator.
    ///
    /// The iterator is lazy: blocks it has not yielded yet stay buffered, so
    /// dropping it early and calling again later resumes where it stopped.
    /// A `unit_size` of zero yields nothing.
    pub fn drain_units(&mut self, unit_size: usize) -> DrainUnits<'_> {
        DrainUnits {
            buffer: &mut self.buffer,
            unit_size,
        }
    }

    /// Bytes waiting for the rest of their unit.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any partial unit, returning how many bytes were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}

/// Iterator over complete blocks, see [`StreamDefragmenter::drain_units`].
#[derive(Debug)]
pub struct DrainUnits<'a> {
    buffer: &'a mut BytesMut,
    unit_size: usize,
}

impl Iterator for DrainUnits<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        if self.unit_size == 0 || self.buffer.len() < self.unit_size {
            return None;
        }
        Some(self.buffer.split_to(self.unit_size).freeze())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.buffer.len().checked_div(self.unit_size).unwrap_or(0);
        (n, Some(n))
    }
}
