pub mod codec;
pub mod device;
pub mod g711;
pub mod jitter;
pub mod pacing;
pub mod playout;
pub mod sequence;
pub mod sequencer;
pub mod wire;

pub use codec::{AudioParams, Codec, CodecError, EncodeSession};
pub use device::{CaptureDevice, DeviceError, RenderDevice};
pub use g711::{G711Law, G711};
pub use jitter::{JitterBufferConfig, JitterBufferStats, SharedJitterBuffer};
pub use playout::{PlaybackScheduler, PlayoutConfig, PlayoutReport, PlayoutState, StopReason};
pub use sequence::{SequenceCounter, SequenceNumber};
pub use sequencer::{FrameSequencer, SequencerConfig, SequencerReport};

use std::time::Duration;

/// Samples per channel in one frame of `frame` duration at `sample_rate` Hz
#[inline]
pub fn samples_per_frame(sample_rate: u32, frame: Duration) -> usize {
    (sample_rate as u128 * frame.as_micros() / 1_000_000) as usize
}

/// Duration of `samples` per-channel samples at `sample_rate` Hz
#[inline]
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples as u64 * 1_000_000 / sample_rate as u64)
}
