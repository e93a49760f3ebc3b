//! Unit framing on the wire.
//!
//! Every transmitted unit is the application payload prefixed by an 8-byte
//! big-endian sequence number. Datagram transports carry one unit per
//! datagram; stream transports are re-framed at the receiver by
//! [`StreamDefragmenter`] (or [`UnitCodec`] when driven by tokio IO).

mod codec;
mod defrag;
mod sequence;

pub use codec::UnitCodec;
pub use defrag::{DrainUnits, StreamDefragmenter};
pub use sequence::{peek_sequence, tag, tag_into, tagged_len, untag, SEQUENCE_TAG_SIZE};
