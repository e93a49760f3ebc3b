//! Tokio codec for fixed-size tagged units.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::sequence::{tag_into, untag, SEQUENCE_TAG_SIZE};
use crate::error::{ProtocolError, Result};
use crate::types::SequenceNumber;

/// Frames a byte stream into `unit_size`-byte tagged units.
#[derive(Debug, Clone, Copy)]
pub struct UnitCodec {
    unit_size: usize,
}

impl UnitCodec {
    /// `unit_size` includes the sequence tag and must be larger than it.
    pub fn new(unit_size: usize) -> Result<Self> {
        if unit_size <= SEQUENCE_TAG_SIZE {
            return Err(ProtocolError::InvalidUnitSize(unit_size).into());
        }
        Ok(Self { unit_size })
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn payload_size(&self) -> usize {
        self.unit_size - SEQUENCE_TAG_SIZE
    }
}

impl Decoder for UnitCodec {
    type Item = (SequenceNumber, Bytes);
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < self.unit_size {
            src.reserve(self.unit_size - src.len());
            return Ok(None);
        }
        let unit = src.split_to(self.unit_size).freeze();
        untag(unit).map(Some)
    }
}

impl Encoder<(SequenceNumber, Bytes)> for UnitCodec {
    type Error = crate::Error;

    fn encode(
        &mut self,
        (seq, payload): (SequenceNumber, Bytes),
        dst: &mut BytesMut,
    ) -> std::result::Result<(), Self::Error> {
        if payload.len() != self.payload_size() {
            return Err(ProtocolError::UnitLengthMismatch {
                expected: self.payload_size(),
                got: payload.len(),
            }
            .into());
        }
        tag_into(seq, &payload, dst);
        Ok(())
    }
}
