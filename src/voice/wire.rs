//! Voice frame wire format
//!
//! `[2 bytes: big-endian u16 sequence number][N bytes: codec payload]`
//!
//! The transport delivers whole frames, so there is no length field.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::sequence::SequenceNumber;

/// Size of the sequence number prefix.
pub const HEADER_LEN: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("voice frame too short: {len} bytes, need at least {HEADER_LEN}")]
    Runt { len: usize },
}

/// A parsed inbound voice frame. The payload is still codec-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub sequence: SequenceNumber,
    pub payload: Bytes,
}

/// Prefix an encoded payload with its sequence number.
pub fn encode_frame(sequence: SequenceNumber, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u16(sequence);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a received datagram into sequence number and payload.
///
/// A frame holding only the header is valid; its empty payload decodes to
/// nothing and is played as silence.
pub fn parse_frame(datagram: &[u8]) -> Result<WireFrame, WireError> {
    if datagram.len() < HEADER_LEN {
        return Err(WireError::Runt { len: datagram.len() });
    }

    Ok(WireFrame {
        sequence: u16::from_be_bytes([datagram[0], datagram[1]]),
        payload: Bytes::copy_from_slice(&datagram[HEADER_LEN..]),
    })
}
