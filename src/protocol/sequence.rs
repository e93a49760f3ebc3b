//! Sequence tag framing.
//!
//! Wire format: an 8-byte big-endian unsigned sequence number immediately
//! followed by the application payload. No length field, no padding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::types::SequenceNumber;

/// Size of the sequence tag in bytes.
pub const SEQUENCE_TAG_SIZE: usize = 8;

/// Total length of a unit carrying `payload_len` bytes.
pub const fn tagged_len(payload_len: usize) -> usize {
    payload_len + SEQUENCE_TAG_SIZE
}

/// Prepend the tag for `seq` to `payload`.
pub fn tag(seq: SequenceNumber, payload: &[u8]) -> Bytes {
    let mut unit = BytesMut::with_capacity(tagged_len(payload.len()));
    tag_into(seq, payload, &mut unit);
    unit.freeze()
}

/// Append a tagged unit to `dst`.
pub fn tag_into(seq: SequenceNumber, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(tagged_len(payload.len()));
    dst.put_u64(seq.get());
    dst.put_slice(payload);
}

/// Split a unit into its sequence number and payload without copying.
pub fn untag(mut unit: Bytes) -> Result<(SequenceNumber, Bytes)> {
    if unit.len() < SEQUENCE_TAG_SIZE {
        return Err(ProtocolError::MalformedUnit {
            len: unit.len(),
            min: SEQUENCE_TAG_SIZE,
        }
        .into());
    }
    let seq = SequenceNumber::new(unit.get_u64());
    Ok((seq, unit))
}

/// Read the sequence number of a unit without consuming it.
pub fn peek_sequence(unit: &[u8]) -> Result<SequenceNumber> {
    let tag: [u8; SEQUENCE_TAG_SIZE] = unit
        .get(..SEQUENCE_TAG_SIZE)
        .and_then(|t| t.try_into().ok())
        .ok_or(ProtocolError::MalformedUnit {
            len: unit.len(),
            min: SEQUENCE_TAG_SIZE,
        })?;
    Ok(SequenceNumber::new(u64::from_be_bytes(tag)))
}
