//! Audio device collaborator contracts
//!
//! Capture reads block until samples are available. Render writes are queued
//! by the device itself (streaming mode), so a write returns once the samples
//! are accepted, not once they are heard.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

use super::samples_to_duration;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    #[error("audio device closed")]
    Closed,

    #[error("audio device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audio device returned no samples for {reads} reads")]
    Stalled { reads: u32 },
}

impl DeviceError {
    /// Errors after which the device cannot be used again
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Closed)
    }
}

pub trait CaptureDevice: Send {
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Block until at least one sample is available, then fill as much of
    /// `buf` as possible. Returns the number of interleaved samples read.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError>;

    fn stop(&mut self);
}

pub trait RenderDevice: Send {
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Queue interleaved samples for playback. Returns samples accepted.
    fn write(&mut self, samples: &[i16]) -> Result<usize, DeviceError>;

    fn stop(&mut self);
}

/// Synthetic sine source that delivers samples at the real-time rate.
///
/// Reads return at most `chunk` samples, so callers see partial reads the
/// way they would from a hardware ring buffer.
#[derive(Debug)]
pub struct ToneCapture {
    sample_rate: u32,
    channels: u16,
    frequency: f32,
    amplitude: f32,
    chunk: usize,
    phase: f32,
    started: Option<Instant>,
    /// Sample frames (per channel) handed out so far
    produced: u64,
}

impl ToneCapture {
    pub fn new(sample_rate: u32, channels: u16, frequency: f32) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frequency,
            amplitude: 0.25,
            // 5 ms per read
            chunk: (sample_rate as usize / 200).max(1) * channels.max(1) as usize,
            phase: 0.0,
            started: None,
            produced: 0,
        }
    }

    fn available(&self, started: Instant) -> u64 {
        started.elapsed().as_micros() as u64 * self.sample_rate as u64 / 1_000_000
    }
}

impl CaptureDevice for ToneCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.sample_rate == 0 {
            return Err(DeviceError::Unavailable("sample rate 0".to_string()));
        }
        self.started = Some(Instant::now());
        self.produced = 0;
        debug!("Tone capture started at {} Hz", self.sample_rate);
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
        let started = self.started.ok_or(DeviceError::Closed)?;
        let channels = self.channels as usize;
        let wanted = (buf.len().min(self.chunk) / channels) as u64;
        if wanted == 0 {
            return Ok(0);
        }

        // Block until the hardware clock would have produced the samples
        let mut ready = self.available(started).saturating_sub(self.produced);
        if ready == 0 {
            let wait = samples_to_duration(wanted as usize, self.sample_rate);
            std::thread::sleep(wait);
            ready = self.available(started).saturating_sub(self.produced).max(1);
        }

        let frames = wanted.min(ready) as usize;
        let step = TAU * self.frequency / self.sample_rate as f32;
        for frame in buf[..frames * channels].chunks_exact_mut(channels) {
            let value = (self.phase.sin() * self.amplitude * i16::MAX as f32) as i16;
            frame.fill(value);
            self.phase = (self.phase + step) % TAU;
        }
        self.produced += frames as u64;
        Ok(frames * channels)
    }

    fn stop(&mut self) {
        self.started = None;
    }
}

/// Counters shared between a [`MeteredRender`] and whoever reports on it
#[derive(Debug, Default)]
pub struct RenderMeter {
    writes: AtomicU64,
    samples: AtomicU64,
    silent_writes: AtomicU64,
}

impl RenderMeter {
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn silent_writes(&self) -> u64 {
        self.silent_writes.load(Ordering::Relaxed)
    }
}

/// Render sink that discards audio and counts what it was given
#[derive(Debug)]
pub struct MeteredRender {
    meter: Arc<RenderMeter>,
    running: bool,
}

impl MeteredRender {
    pub fn new() -> (Self, Arc<RenderMeter>) {
        let meter = Arc::new(RenderMeter::default());
        (
            Self {
                meter: Arc::clone(&meter),
                running: false,
            },
            meter,
        )
    }
}

impl RenderDevice for MeteredRender {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.running = true;
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize, DeviceError> {
        if !self.running {
            return Err(DeviceError::Closed);
        }
        self.meter.writes.fetch_add(1, Ordering::Relaxed);
        self.meter.samples.fetch_add(samples.len() as u64, Ordering::Relaxed);
        if samples.iter().all(|&s| s == 0) {
            self.meter.silent_writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(samples.len())
    }

    fn stop(&mut self) {
        self.running = false;
    }
}
