//! Codec collaborator contract
//!
//! One [`EncodeSession`] per outgoing call, owned by the capture thread.
//! Decoding is stateless per frame and may run on the playout task.
//! Every call must finish well inside one frame duration.

use thiserror::Error;

/// Decoded output is capped at 120 ms of 48 kHz audio per channel.
pub const MAX_DECODED_SAMPLES_PER_CHANNEL: usize = 5760;

/// Audio format negotiated for an encode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bits per second hint; fixed-rate codecs ignore it.
    pub bitrate: u32,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode session unavailable")]
    SessionUnavailable,

    #[error("empty payload")]
    EmptyPayload,

    #[error("frame of {len} samples does not divide into {channels} channels")]
    InvalidFrameLength { len: usize, channels: u16 },

    #[error("payload decodes to {samples} samples per channel, limit is {max}")]
    PayloadTooLarge { samples: usize, max: usize },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// A live encoder. Dropping it releases the session.
pub trait EncodeSession: Send {
    /// Encode exactly one frame of interleaved PCM.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
}

pub trait Codec: Send + Sync {
    /// Human readable codec name for logs.
    fn name(&self) -> &'static str;

    fn create_encode_session(
        &self,
        params: AudioParams,
    ) -> Result<Box<dyn EncodeSession>, CodecError>;

    /// Decode one payload to interleaved PCM.
    fn decode(&self, payload: &[u8], sample_rate: u32, channels: u16)
        -> Result<Vec<i16>, CodecError>;
}
