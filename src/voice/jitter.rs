//! Voice jitter buffer
//!
//! Absorbs reordering and duplication from the transport and hands frames to
//! the playout task in sequence order. Frames are kept in a deque ordered by
//! insertion position; in-order arrivals append at the tail and late arrivals
//! are spliced in by scanning backwards from the tail.
//!
//! Every frame accounts for one nominal frame duration regardless of payload
//! size, and the head is evicted whenever the total exceeds the configured
//! maximum.

use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::sequence::{is_newer, is_older, SequenceNumber};
use super::wire::{parse_frame, WireError};

/// Configuration for the jitter buffer
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Nominal duration every buffered frame accounts for
    pub frame_duration: Duration,
    /// Upper bound on buffered audio. Older frames are evicted past this.
    pub max_buffered: Duration,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            frame_duration: Duration::from_millis(20),
            max_buffered: Duration::from_millis(200),
        }
    }
}

/// Frame payload. Decoding is deferred until playout, so frames that are
/// dropped never pay for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Encoded(Bytes),
    Decoded(Vec<i16>),
}

/// A frame waiting for playout
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub sequence: SequenceNumber,
    pub payload: FramePayload,
    pub enqueued_at: Instant,
}

impl BufferedFrame {
    pub fn encoded(sequence: SequenceNumber, payload: Bytes) -> Self {
        Self {
            sequence,
            payload: FramePayload::Encoded(payload),
            enqueued_at: Instant::now(),
        }
    }

    pub fn decoded(sequence: SequenceNumber, samples: Vec<i16>) -> Self {
        Self {
            sequence,
            payload: FramePayload::Decoded(samples),
            enqueued_at: Instant::now(),
        }
    }
}

/// What happened to an inserted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Placed at the tail (in order, or ahead after a gap)
    Appended,
    /// Late arrival spliced in behind newer frames
    Reordered,
    /// Sequence number already buffered
    Duplicate,
    /// Older than everything buffered, or already played
    Stale,
}

impl InsertOutcome {
    pub fn accepted(self) -> bool {
        matches!(self, Self::Appended | Self::Reordered)
    }
}

/// Jitter buffer state
#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterBufferConfig,
    frames: VecDeque<BufferedFrame>,
    /// Last sequence number that left the buffer (played or evicted)
    horizon: Option<SequenceNumber>,
    stats: JitterBufferStats,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            config,
            frames: VecDeque::new(),
            horizon: None,
            stats: JitterBufferStats::default(),
        }
    }

    pub fn config(&self) -> &JitterBufferConfig {
        &self.config
    }

    /// Insert a frame, then evict from the head if over the duration bound
    pub fn insert(&mut self, frame: BufferedFrame) -> InsertOutcome {
        self.stats.frames_received += 1;
        let seq = frame.sequence;

        let outcome = match (self.horizon, self.frames.back().map(|f| f.sequence)) {
            // Anything at or behind what already left the buffer is too late
            (Some(horizon), _) if !is_newer(seq, horizon) => InsertOutcome::Stale,
            (_, None) => {
                self.frames.push_back(frame);
                InsertOutcome::Appended
            }
            (_, Some(last)) if seq == last.wrapping_add(1) => {
                self.frames.push_back(frame);
                InsertOutcome::Appended
            }
            (_, Some(last)) if is_newer(seq, last) => {
                trace!("Gap before seq={} (tail was {})", seq, last);
                self.frames.push_back(frame);
                InsertOutcome::Appended
            }
            (_, Some(_)) => self.splice_late(frame),
        };

        match outcome {
            InsertOutcome::Appended => self.stats.frames_accepted += 1,
            InsertOutcome::Reordered => {
                self.stats.frames_accepted += 1;
                self.stats.frames_reordered += 1;
            }
            InsertOutcome::Duplicate => {
                trace!("Dropping duplicate frame: seq={}", seq);
                self.stats.duplicates += 1;
            }
            InsertOutcome::Stale => {
                trace!("Dropping stale frame: seq={}", seq);
                self.stats.stale += 1;
            }
        }

        self.evict_overflow();
        outcome
    }

    /// Scan from the tail for the slot right after the newest older frame
    fn splice_late(&mut self, frame: BufferedFrame) -> InsertOutcome {
        let seq = frame.sequence;
        for idx in (0..self.frames.len()).rev() {
            let existing = self.frames[idx].sequence;
            if existing == seq {
                return InsertOutcome::Duplicate;
            }
            if is_older(existing, seq) {
                debug!("Reordered late frame: seq={} placed after {}", seq, existing);
                self.frames.insert(idx + 1, frame);
                return InsertOutcome::Reordered;
            }
        }
        InsertOutcome::Stale
    }

    /// Take the head frame for playout
    pub fn pop(&mut self) -> Option<BufferedFrame> {
        let frame = self.frames.pop_front()?;
        self.horizon = Some(frame.sequence);
        self.stats.frames_drained += 1;
        self.evict_overflow();
        Some(frame)
    }

    /// Drop head frames while buffered duration exceeds the maximum.
    /// Returns the number of frames evicted.
    pub fn evict_overflow(&mut self) -> usize {
        let mut evicted = 0;
        while self.buffered_duration() > self.config.max_buffered {
            let Some(frame) = self.frames.pop_front() else {
                break;
            };
            self.horizon = Some(frame.sequence);
            evicted += 1;
        }
        if evicted > 0 {
            self.stats.evicted += evicted as u64;
            warn!(
                "Buffer overflow, evicted {} frame(s), depth now {}",
                evicted,
                self.frames.len()
            );
        }
        evicted
    }

    /// Buffered audio, counting each frame at its nominal duration
    pub fn buffered_duration(&self) -> Duration {
        self.config.frame_duration * self.frames.len() as u32
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sequence numbers head to tail
    pub fn sequences(&self) -> Vec<SequenceNumber> {
        self.frames.iter().map(|f| f.sequence).collect()
    }

    /// Drop everything, including the playout horizon (session stop)
    pub fn clear(&mut self) {
        self.frames.clear();
        self.horizon = None;
    }

    pub fn record_malformed(&mut self) {
        self.stats.malformed += 1;
    }

    /// Get buffer statistics
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            depth: self.frames.len(),
            buffered_ms: self.buffered_duration().as_millis() as u64,
            ..self.stats.clone()
        }
    }
}

/// Statistics about jitter buffer operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct JitterBufferStats {
    pub frames_received: u64,
    pub frames_accepted: u64,
    pub frames_reordered: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub evicted: u64,
    pub frames_drained: u64,
    pub malformed: u64,
    pub depth: usize,
    pub buffered_ms: u64,
}

/// The jitter buffer shared between delivery producers and the playout task.
///
/// Every operation takes the one mutex for its whole duration; the lock is
/// never held across an `.await`. Accepted inserts wake a warming-up
/// scheduler through [`SharedJitterBuffer::arrival`].
#[derive(Debug)]
pub struct SharedJitterBuffer {
    inner: Mutex<JitterBuffer>,
    arrivals: Notify,
}

impl SharedJitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            inner: Mutex::new(JitterBuffer::new(config)),
            arrivals: Notify::new(),
        }
    }

    // A panic mid-operation leaves the deque structurally valid, so keep going
    fn lock(&self) -> MutexGuard<'_, JitterBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, frame: BufferedFrame) -> InsertOutcome {
        let outcome = self.lock().insert(frame);
        if outcome.accepted() {
            self.arrivals.notify_one();
        }
        outcome
    }

    /// Delivery callback: parse a raw framed payload and buffer it
    pub fn deliver(&self, datagram: &[u8]) -> Result<InsertOutcome, WireError> {
        match parse_frame(datagram) {
            Ok(frame) => Ok(self.insert(BufferedFrame::encoded(frame.sequence, frame.payload))),
            Err(e) => {
                self.lock().record_malformed();
                Err(e)
            }
        }
    }

    pub fn pop(&self) -> Option<BufferedFrame> {
        self.lock().pop()
    }

    pub fn evict_overflow(&self) -> usize {
        self.lock().evict_overflow()
    }

    pub fn buffered_duration(&self) -> Duration {
        self.lock().buffered_duration()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> JitterBufferStats {
        self.lock().stats()
    }

    /// Resolves once a frame has been accepted since the last call
    pub async fn arrival(&self) {
        self.arrivals.notified().await;
    }
}
