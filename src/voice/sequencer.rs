//! Send-side frame sequencer
//!
//! Reads exactly one frame of PCM per cycle from the capture device
//! (accumulating partial reads), encodes it, stamps the next sequence number
//! and hands the framed payload to the transport. Encode trouble skips the
//! cycle; only a dead capture device ends the loop.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::codec::{AudioParams, Codec, CodecError, EncodeSession};
use super::device::{CaptureDevice, DeviceError};
use super::playout::StopReason;
use super::sequence::{SequenceCounter, SequenceNumber};
use super::wire::encode_frame;
use crate::transport::Transport;

/// Consecutive empty capture reads before the cycle gives up
const EMPTY_READ_LIMIT: u32 = 8;

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub params: AudioParams,
    /// Capture cadence
    pub frame_duration: Duration,
}

impl SequencerConfig {
    /// Interleaved samples read per cycle
    pub fn frame_len(&self) -> usize {
        super::samples_per_frame(self.params.sample_rate, self.frame_duration)
            * self.params.channels as usize
    }
}

/// An encoded frame ready for the wire
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: SequenceNumber,
    pub payload: Bytes,
    pub captured_at: Instant,
}

impl Frame {
    pub fn to_wire(&self) -> Bytes {
        encode_frame(self.sequence, &self.payload)
    }
}

/// What one capture cycle produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Emitted(SequenceNumber),
    /// No encode session could be obtained
    Skipped,
    EncodeFailed,
    /// Stop was requested before the frame was complete
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SequencerStats {
    pub frames_emitted: u64,
    pub encode_failures: u64,
    pub skipped_cycles: u64,
    pub send_failures: u64,
    pub capture_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SequencerReport {
    pub reason: StopReason,
    pub stats: SequencerStats,
}

pub struct FrameSequencer<T: Transport> {
    config: SequencerConfig,
    counter: SequenceCounter,
    codec: Arc<dyn Codec>,
    session: Option<Box<dyn EncodeSession>>,
    capture: Box<dyn CaptureDevice>,
    transport: Arc<T>,
    destination: T::Destination,
    pcm: Vec<i16>,
    filled: usize,
    stats: SequencerStats,
}

impl<T: Transport> FrameSequencer<T> {
    /// `capture` must already be started; the sequencer stops it on exit.
    pub fn new(
        config: SequencerConfig,
        codec: Arc<dyn Codec>,
        session: Box<dyn EncodeSession>,
        capture: Box<dyn CaptureDevice>,
        transport: Arc<T>,
        destination: T::Destination,
    ) -> Self {
        let pcm = vec![0i16; config.frame_len()];
        Self {
            config,
            counter: SequenceCounter::new(),
            codec,
            session: Some(session),
            capture,
            transport,
            destination,
            pcm,
            filled: 0,
            stats: SequencerStats::default(),
        }
    }

    pub fn stats(&self) -> &SequencerStats {
        &self.stats
    }

    /// Block until a whole frame has been captured. Returns `None` if
    /// cancelled first; samples already read are kept for the next call.
    fn fill_frame(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Instant>, DeviceError> {
        let mut empty_reads = 0;
        while self.filled < self.pcm.len() {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let n = self.capture.read(&mut self.pcm[self.filled..])?;
            if n == 0 {
                empty_reads += 1;
                if empty_reads >= EMPTY_READ_LIMIT {
                    return Err(DeviceError::Stalled { reads: empty_reads });
                }
                std::thread::sleep(self.empty_read_backoff());
                continue;
            }
            empty_reads = 0;
            if n < self.pcm.len() - self.filled {
                trace!("Partial capture read: {} samples", n);
            }
            self.filled += n.min(self.pcm.len() - self.filled);
        }
        Ok(Some(Instant::now()))
    }

    fn empty_read_backoff(&self) -> Duration {
        self.config.frame_duration / EMPTY_READ_LIMIT
    }

    /// Drop the current session so the next cycle creates a fresh one
    fn discard_session(&mut self) {
        if self.session.take().is_some() {
            warn!("Encode session lost, will recreate");
        }
    }

    /// Make sure an encode session exists, recreating a lost one
    fn ensure_session(&mut self) {
        if self.session.is_some() {
            return;
        }
        match self.codec.create_encode_session(self.config.params) {
            Ok(session) => {
                info!("Recreated {} encode session", self.codec.name());
                self.session = Some(session);
            }
            Err(e) => debug!("Encode session still unavailable: {}", e),
        }
    }

    /// Encode the captured frame and send it
    fn emit(&mut self, captured_at: Instant) -> Cycle {
        self.filled = 0;

        self.ensure_session();
        let encoded = match self.session.as_mut() {
            Some(session) => session.encode(&self.pcm),
            None => {
                self.stats.skipped_cycles += 1;
                return Cycle::Skipped;
            }
        };

        let payload = match encoded {
            Ok(payload) if !payload.is_empty() => payload,
            Ok(_) => {
                debug!("Encoder produced no output, skipping cycle");
                self.stats.encode_failures += 1;
                return Cycle::EncodeFailed;
            }
            Err(CodecError::SessionUnavailable) => {
                self.stats.encode_failures += 1;
                self.discard_session();
                return Cycle::EncodeFailed;
            }
            Err(e) => {
                warn!("Encode failed, skipping cycle: {}", e);
                self.stats.encode_failures += 1;
                return Cycle::EncodeFailed;
            }
        };

        let frame = Frame {
            sequence: self.counter.next(),
            payload: Bytes::from(payload),
            captured_at,
        };
        trace!("Emitting seq={} ({} bytes)", frame.sequence, frame.payload.len());

        if let Err(e) = self.transport.send(&self.destination, frame.to_wire()) {
            debug!("Send failed for seq={}: {}", frame.sequence, e);
            self.stats.send_failures += 1;
        }
        self.stats.frames_emitted += 1;
        Cycle::Emitted(frame.sequence)
    }

    /// One capture, encode and send cycle
    pub fn cycle(&mut self, cancel: &CancellationToken) -> Result<Cycle, DeviceError> {
        match self.fill_frame(cancel)? {
            Some(captured_at) => Ok(self.emit(captured_at)),
            None => Ok(Cycle::Cancelled),
        }
    }

    /// Run cycles on the calling thread until cancelled or the capture device
    /// fails. Stops the device and releases the encode session on exit.
    pub fn run_blocking(mut self, cancel: &CancellationToken) -> SequencerReport {
        debug!(
            "Sequencer running: {} samples per {:?} frame",
            self.pcm.len(),
            self.config.frame_duration
        );

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Requested;
            }
            match self.cycle(cancel) {
                Ok(Cycle::Cancelled) => break StopReason::Requested,
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!("Capture device failed: {}", e);
                    break StopReason::DeviceFailure;
                }
                Err(e) => {
                    warn!("Capture read failed: {}", e);
                    self.stats.capture_errors += 1;
                }
            }
        };

        self.capture.stop();
        self.session = None;
        info!("Sequencer stopped after {} frames", self.stats.frames_emitted);

        SequencerReport {
            reason,
            stats: self.stats,
        }
    }
}
