//! Playback scheduler
//!
//! The sole consumer of the jitter buffer. Warms up until enough audio is
//! buffered (or a bounded wait elapses), then drains one frame per frame
//! period: decode just in time, write to the render device, and pace against
//! the monotonic clock. An empty buffer is masked with one frame of silence
//! per cycle, and a far end that stays silent past the idle timeout stops
//! playout.
//!
//! ```text
//! Stopped --Start--> WarmingUp --WarmedUp--> Draining
//!    ^                   |                      |
//!    +---- Stop / IdleTimeout / DeviceFailure --+
//! ```

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::codec::Codec;
use super::device::{DeviceError, RenderDevice};
use super::jitter::{BufferedFrame, FramePayload, SharedJitterBuffer};
use super::pacing::Pacer;

#[derive(Debug, Clone)]
pub struct PlayoutConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Nominal duration of one frame
    pub frame_duration: Duration,
    /// Buffered audio required before draining starts
    pub warmup_target: Duration,
    /// Longest the scheduler waits for the warm-up target
    pub warmup_max_wait: Duration,
    /// Consecutive underrun time after which playout stops
    pub idle_timeout: Duration,
}

impl PlayoutConfig {
    /// Interleaved samples in one frame
    pub fn frame_len(&self) -> usize {
        super::samples_per_frame(self.sample_rate, self.frame_duration) * self.channels as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlayoutState {
    Stopped,
    WarmingUp,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayoutEvent {
    Start,
    WarmedUp,
    Stop,
    IdleTimeout,
    DeviceFailure,
}

impl PlayoutState {
    /// Transition table. Events that do not apply leave the state unchanged.
    pub fn next(self, event: PlayoutEvent) -> PlayoutState {
        match (self, event) {
            (PlayoutState::Stopped, PlayoutEvent::Start) => PlayoutState::WarmingUp,
            (PlayoutState::WarmingUp, PlayoutEvent::WarmedUp) => PlayoutState::Draining,
            (_, PlayoutEvent::Stop | PlayoutEvent::IdleTimeout | PlayoutEvent::DeviceFailure) => {
                PlayoutState::Stopped
            }
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Requested,
    IdleTimeout,
    DeviceFailure,
}

impl StopReason {
    fn event(self) -> PlayoutEvent {
        match self {
            StopReason::Requested => PlayoutEvent::Stop,
            StopReason::IdleTimeout => PlayoutEvent::IdleTimeout,
            StopReason::DeviceFailure => PlayoutEvent::DeviceFailure,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlayoutStats {
    pub frames_played: u64,
    pub decode_failures: u64,
    pub write_failures: u64,
    /// Silence written for underruns and for undecodable frames
    pub silence_frames: u64,
    pub underruns: u64,
    pub resyncs: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayoutReport {
    pub reason: StopReason,
    pub stats: PlayoutStats,
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A buffered frame (or silence in place of an undecodable one) was written
    Played,
    /// The buffer was empty and one frame of silence was written
    Underrun,
    /// The buffer has been empty for longer than the idle timeout
    Idle,
}

pub struct PlaybackScheduler {
    config: PlayoutConfig,
    buffer: Arc<SharedJitterBuffer>,
    codec: Arc<dyn Codec>,
    device: Box<dyn RenderDevice>,
    silence: Vec<i16>,
    underrun_since: Option<Instant>,
    state: watch::Sender<PlayoutState>,
    stats: PlayoutStats,
}

impl PlaybackScheduler {
    /// `device` must already be started; the scheduler stops it on exit.
    pub fn new(
        config: PlayoutConfig,
        buffer: Arc<SharedJitterBuffer>,
        codec: Arc<dyn Codec>,
        device: Box<dyn RenderDevice>,
    ) -> Self {
        let silence = vec![0i16; config.frame_len()];
        let (state, _) = watch::channel(PlayoutState::Stopped);
        Self {
            config,
            buffer,
            codec,
            device,
            silence,
            underrun_since: None,
            state,
            stats: PlayoutStats::default(),
        }
    }

    pub fn state(&self) -> PlayoutState {
        *self.state.borrow()
    }

    /// Follow state changes from another task
    pub fn subscribe(&self) -> watch::Receiver<PlayoutState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &PlayoutStats {
        &self.stats
    }

    fn transition(&self, event: PlayoutEvent) {
        self.state.send_modify(|state| {
            let next = state.next(event);
            if next != *state {
                debug!("Playout {:?} -> {:?} on {:?}", state, next, event);
                *state = next;
            }
        });
    }

    /// Run until stopped. Always stops the render device and clears the
    /// buffer before returning, whatever the reason.
    pub async fn run(mut self, cancel: CancellationToken) -> PlayoutReport {
        self.transition(PlayoutEvent::Start);
        let reason = self.run_until_stopped(&cancel).await;

        self.device.stop();
        self.buffer.clear();
        self.transition(reason.event());

        match reason {
            StopReason::Requested => info!("Playout stopped"),
            StopReason::IdleTimeout => info!(
                "Playout stopped: no audio for {:?}",
                self.config.idle_timeout
            ),
            StopReason::DeviceFailure => error!("Playout stopped: render device failed"),
        }

        PlayoutReport {
            reason,
            stats: self.stats,
        }
    }

    async fn run_until_stopped(&mut self, cancel: &CancellationToken) -> StopReason {
        if !self.warm_up(cancel).await {
            return StopReason::Requested;
        }
        self.transition(PlayoutEvent::WarmedUp);

        let frame = self.config.frame_duration;
        let mut pacer = Pacer::new(Instant::now());

        loop {
            let delay = pacer.delay_until_next(Instant::now());
            if !delay.is_zero() && !sleep_or_cancel(pacer.scheduled_next(), cancel).await {
                return StopReason::Requested;
            }
            if cancel.is_cancelled() {
                return StopReason::Requested;
            }

            match self.tick(Instant::now()) {
                Ok(Tick::Played) => pacer.schedule_from(Instant::now(), frame),
                Ok(Tick::Underrun) => {
                    let now = Instant::now();
                    pacer.restart_after(now, self.config.warmup_target);
                    if !sleep_or_cancel(now + frame, cancel).await {
                        return StopReason::Requested;
                    }
                }
                Ok(Tick::Idle) => return StopReason::IdleTimeout,
                Err(e) => {
                    error!("Render device failed: {}", e);
                    return StopReason::DeviceFailure;
                }
            }

            self.stats.resyncs = pacer.resyncs();
            self.stats.evicted += self.buffer.evict_overflow() as u64;
        }
    }

    /// Wait for the warm-up target or the bounded warm-up wait.
    /// Returns false if cancelled.
    async fn warm_up(&mut self, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.config.warmup_max_wait;
        loop {
            let buffered = self.buffer.buffered_duration();
            if buffered >= self.config.warmup_target {
                debug!("Warm-up complete with {:?} buffered", buffered);
                return true;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = sleep_until(deadline) => {
                    debug!("Warm-up wait elapsed with {:?} buffered", buffered);
                    return true;
                }
                _ = self.buffer.arrival() => {}
            }
        }
    }

    /// One drain cycle: pop, decode, write. Does not sleep.
    pub fn tick(&mut self, now: Instant) -> Result<Tick, DeviceError> {
        match self.buffer.pop() {
            Some(frame) => {
                self.underrun_since = None;
                let sequence = frame.sequence;
                let decoded = self.decode(frame);
                let samples = match decoded.as_deref() {
                    Some(samples) => samples,
                    None => {
                        self.stats.silence_frames += 1;
                        &self.silence
                    }
                };
                trace!("Playing seq={} ({} samples)", sequence, samples.len());
                write_frame(self.device.as_mut(), &mut self.stats, samples)?;
                self.stats.frames_played += 1;
                Ok(Tick::Played)
            }
            None => {
                let since = *self.underrun_since.get_or_insert(now);
                if now.duration_since(since) >= self.config.idle_timeout {
                    return Ok(Tick::Idle);
                }
                self.stats.underruns += 1;
                self.stats.silence_frames += 1;
                trace!("Underrun, writing {} samples of silence", self.silence.len());
                write_frame(self.device.as_mut(), &mut self.stats, &self.silence)?;
                Ok(Tick::Underrun)
            }
        }
    }

    /// Decode a frame now that it is about to play. `None` means play silence.
    fn decode(&mut self, frame: BufferedFrame) -> Option<Vec<i16>> {
        let samples = match frame.payload {
            FramePayload::Decoded(samples) => samples,
            FramePayload::Encoded(bytes) => {
                match self
                    .codec
                    .decode(&bytes, self.config.sample_rate, self.config.channels)
                {
                    Ok(samples) => samples,
                    Err(e) => {
                        debug!("Decode failed for seq={}: {}", frame.sequence, e);
                        self.stats.decode_failures += 1;
                        return None;
                    }
                }
            }
        };

        if samples.is_empty() {
            debug!("Empty frame seq={}, playing silence", frame.sequence);
            self.stats.decode_failures += 1;
            return None;
        }
        Some(samples)
    }
}

/// Write one frame. Transient failures are logged and the slot is lost;
/// fatal ones propagate.
fn write_frame(
    device: &mut dyn RenderDevice,
    stats: &mut PlayoutStats,
    samples: &[i16],
) -> Result<(), DeviceError> {
    match device.write(samples) {
        Ok(written) => {
            if written < samples.len() {
                trace!("Short render write: {}/{}", written, samples.len());
            }
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!("Render write failed: {}", e);
            stats.write_failures += 1;
            Ok(())
        }
    }
}

/// Sleep until `deadline`. Returns false if cancelled first.
async fn sleep_or_cancel(deadline: Instant, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep_until(deadline) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::codec::{AudioParams, CodecError, EncodeSession};
    use crate::voice::jitter::JitterBufferConfig;
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Codec whose "decode" turns each payload byte into one sample
    struct ByteCodec;

    impl Codec for ByteCodec {
        fn name(&self) -> &'static str {
            "bytes"
        }

        fn create_encode_session(
            &self,
            _params: AudioParams,
        ) -> Result<Box<dyn EncodeSession>, CodecError> {
            Err(CodecError::SessionUnavailable)
        }

        fn decode(&self, payload: &[u8], _rate: u32, _channels: u16) -> Result<Vec<i16>, CodecError> {
            if payload == [0xEE] {
                return Err(CodecError::UnsupportedFormat("corrupt".into()));
            }
            Ok(payload.iter().map(|&b| b as i16).collect())
        }
    }

    #[derive(Default)]
    struct Recorded {
        writes: Vec<(Instant, Vec<i16>)>,
        stopped: bool,
    }

    struct RecordingRender {
        log: Arc<Mutex<Recorded>>,
        fail_with: Option<fn() -> DeviceError>,
        /// How long each write blocks
        write_time: Duration,
    }

    impl RenderDevice for RecordingRender {
        fn start(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn write(&mut self, samples: &[i16]) -> Result<usize, DeviceError> {
            if let Some(make) = self.fail_with {
                return Err(make());
            }
            let started = Instant::now();
            if !self.write_time.is_zero() {
                std::thread::sleep(self.write_time);
            }
            self.log
                .lock()
                .unwrap()
                .writes
                .push((started, samples.to_vec()));
            Ok(samples.len())
        }

        fn stop(&mut self) {
            self.log.lock().unwrap().stopped = true;
        }
    }

    fn config() -> PlayoutConfig {
        PlayoutConfig {
            sample_rate: 400,
            channels: 1,
            frame_duration: Duration::from_millis(20),
            warmup_target: Duration::from_millis(40),
            warmup_max_wait: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(200),
        }
    }

    fn setup(
        fail_with: Option<fn() -> DeviceError>,
    ) -> (PlaybackScheduler, Arc<SharedJitterBuffer>, Arc<Mutex<Recorded>>) {
        setup_device(fail_with, Duration::ZERO)
    }

    fn setup_device(
        fail_with: Option<fn() -> DeviceError>,
        write_time: Duration,
    ) -> (PlaybackScheduler, Arc<SharedJitterBuffer>, Arc<Mutex<Recorded>>) {
        let buffer = Arc::new(SharedJitterBuffer::new(JitterBufferConfig {
            frame_duration: Duration::from_millis(20),
            max_buffered: Duration::from_millis(200),
        }));
        let log = Arc::new(Mutex::new(Recorded::default()));
        let device = RecordingRender {
            log: Arc::clone(&log),
            fail_with,
            write_time,
        };
        let scheduler = PlaybackScheduler::new(
            config(),
            Arc::clone(&buffer),
            Arc::new(ByteCodec),
            Box::new(device),
        );
        (scheduler, buffer, log)
    }

    fn frame(seq: u16, payload: &'static [u8]) -> BufferedFrame {
        BufferedFrame::encoded(seq, Bytes::from_static(payload))
    }

    #[test]
    fn test_state_transitions() {
        use PlayoutEvent::*;
        use PlayoutState::*;

        assert_eq!(Stopped.next(Start), WarmingUp);
        assert_eq!(WarmingUp.next(WarmedUp), Draining);
        assert_eq!(Draining.next(IdleTimeout), Stopped);
        assert_eq!(WarmingUp.next(Stop), Stopped);
        assert_eq!(Draining.next(DeviceFailure), Stopped);
        // events that do not apply are ignored
        assert_eq!(Stopped.next(WarmedUp), Stopped);
        assert_eq!(Draining.next(Start), Draining);
    }

    #[test]
    fn test_frame_len() {
        let cfg = PlayoutConfig {
            sample_rate: 48000,
            channels: 2,
            ..config()
        };
        assert_eq!(cfg.frame_len(), 1920);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_decodes_just_in_time() {
        let (mut scheduler, buffer, log) = setup(None);
        buffer.insert(frame(1, &[1, 2, 3]));
        buffer.insert(BufferedFrame::decoded(2, vec![9, 9]));

        assert_eq!(scheduler.tick(Instant::now()).unwrap(), Tick::Played);
        assert_eq!(scheduler.tick(Instant::now()).unwrap(), Tick::Played);

        let writes: Vec<Vec<i16>> = log.lock().unwrap().writes.iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(writes, vec![vec![1, 2, 3], vec![9, 9]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_frame_plays_silence() {
        let (mut scheduler, buffer, log) = setup(None);
        buffer.insert(frame(1, &[0xEE]));
        buffer.insert(frame(2, &[]));

        assert_eq!(scheduler.tick(Instant::now()).unwrap(), Tick::Played);
        assert_eq!(scheduler.tick(Instant::now()).unwrap(), Tick::Played);

        let log = log.lock().unwrap();
        assert_eq!(log.writes.len(), 2);
        for (_, samples) in &log.writes {
            assert_eq!(samples, &vec![0i16; 8]);
        }
        assert_eq!(scheduler.stats().decode_failures, 2);
        assert_eq!(scheduler.stats().silence_frames, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_empty_tick_writes_one_silence_frame() {
        let (mut scheduler, _buffer, log) = setup(None);
        let start = Instant::now();

        for i in 0..3u32 {
            let tick = scheduler.tick(start + Duration::from_millis(20) * i).unwrap();
            assert_eq!(tick, Tick::Underrun);
            assert_eq!(log.lock().unwrap().writes.len(), i as usize + 1);
        }

        for (_, samples) in &log.lock().unwrap().writes {
            assert_eq!(samples.len(), 8);
            assert!(samples.iter().all(|&s| s == 0));
        }

        // past the idle timeout nothing more is written
        let tick = scheduler.tick(start + Duration::from_millis(200)).unwrap();
        assert_eq!(tick, Tick::Idle);
        assert_eq!(log.lock().unwrap().writes.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_failure_is_not_fatal() {
        let (mut scheduler, buffer, _log) =
            setup(Some(|| DeviceError::Io(std::io::Error::other("xrun"))));
        buffer.insert(frame(1, &[1]));

        assert_eq!(scheduler.tick(Instant::now()).unwrap(), Tick::Played);
        assert_eq!(scheduler.stats().write_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_write_failure_stops_playout() {
        let (scheduler, buffer, log) = setup(Some(|| DeviceError::Closed));
        buffer.insert(frame(1, &[1]));
        buffer.insert(frame(2, &[2]));

        let report = scheduler.run(CancellationToken::new()).await;

        assert_eq!(report.reason, StopReason::DeviceFailure);
        assert!(log.lock().unwrap().stopped);
        assert_eq!(buffer.stats().depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_plays_in_order_then_idles_out() {
        let (scheduler, buffer, log) = setup(None);
        let mut states = scheduler.subscribe();
        for (seq, payload) in [(5u16, &[5u8][..]), (6, &[6]), (8, &[8]), (7, &[7])] {
            buffer.insert(BufferedFrame::encoded(seq, Bytes::copy_from_slice(payload)));
        }

        let report = scheduler.run(CancellationToken::new()).await;

        assert_eq!(report.reason, StopReason::IdleTimeout);
        assert_eq!(report.stats.frames_played, 4);
        assert!(report.stats.underruns >= 1);
        assert_eq!(*states.borrow_and_update(), PlayoutState::Stopped);

        let log = log.lock().unwrap();
        let played: Vec<i16> = log
            .writes
            .iter()
            .filter(|(_, s)| s.iter().any(|&v| v != 0))
            .map(|(_, s)| s[0])
            .collect();
        assert_eq!(played, vec![5, 6, 7, 8]);

        // frames are paced one frame period apart
        let times: Vec<Instant> = log.writes.iter().take(4).map(|(t, _)| *t).collect();
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(20));
        }
        assert!(log.stopped);
    }

    /// Gaps between write starts for the frames that carried audio
    fn played_gaps(log: &Recorded) -> Vec<Duration> {
        let starts: Vec<Instant> = log
            .writes
            .iter()
            .filter(|(_, s)| s.iter().any(|&v| v != 0))
            .map(|(t, _)| *t)
            .collect();
        starts.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    #[tokio::test]
    async fn test_write_latency_adds_to_period() {
        let (scheduler, buffer, log) = setup_device(None, Duration::from_millis(8));
        for seq in 0..8u16 {
            buffer.insert(BufferedFrame::decoded(seq, vec![seq as i16 + 1; 8]));
        }

        let report = scheduler.run(CancellationToken::new()).await;
        assert_eq!(report.stats.frames_played, 8);

        let gaps = played_gaps(&log.lock().unwrap());
        assert_eq!(gaps.len(), 7);
        // 8 ms write plus a full 20 ms frame measured after it
        for gap in &gaps {
            assert!(*gap >= Duration::from_millis(28), "gaps: {:?}", gaps);
        }
    }

    #[tokio::test]
    async fn test_slow_device_does_not_build_backlog() {
        let write_time = Duration::from_millis(30);
        let (scheduler, buffer, log) = setup_device(None, write_time);
        for seq in 0..10u16 {
            buffer.insert(BufferedFrame::decoded(seq, vec![seq as i16 + 1; 8]));
        }

        let report = scheduler.run(CancellationToken::new()).await;

        assert_eq!(report.reason, StopReason::IdleTimeout);
        assert_eq!(report.stats.frames_played, 10);
        assert_eq!(report.stats.evicted, 0);

        let log = log.lock().unwrap();
        let played: Vec<i16> = log
            .writes
            .iter()
            .filter(|(_, s)| s.iter().any(|&v| v != 0))
            .map(|(_, s)| s[0])
            .collect();
        assert_eq!(played, (1..=10).collect::<Vec<i16>>());

        // Every gap is one write plus one frame: no bursts to catch up, and
        // no lag that grows from frame to frame.
        let gaps = played_gaps(&log);
        assert_eq!(gaps.len(), 9);
        let steady = write_time + Duration::from_millis(20);
        for gap in &gaps {
            assert!(*gap >= steady, "gaps: {:?}", gaps);
            assert!(*gap < steady * 2, "gaps: {:?}", gaps);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_waits_for_target() {
        let (scheduler, buffer, log) = setup(None);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        buffer.insert(frame(1, &[1]));
        let feeder = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                buffer.insert(frame(2, &[2]));
            })
        };

        let handle = tokio::spawn(scheduler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        let report = handle.await.unwrap();
        feeder.await.unwrap();

        assert_eq!(report.reason, StopReason::Requested);
        let log = log.lock().unwrap();
        // nothing was written before the second frame arrived
        let first = log.writes.first().expect("should have played").0;
        assert_eq!(first - start, Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_stream_stops_after_idle_timeout() {
        let (scheduler, _buffer, log) = setup(None);
        let start = Instant::now();

        let report = scheduler.run(CancellationToken::new()).await;

        assert_eq!(report.reason, StopReason::IdleTimeout);
        assert_eq!(report.stats.frames_played, 0);
        assert!(report.stats.underruns >= 1);
        assert_eq!(report.stats.silence_frames, report.stats.underruns);

        let log = log.lock().unwrap();
        assert_eq!(log.writes.len() as u64, report.stats.underruns);
        // bounded warm-up wait, then underruns until the idle timeout
        assert!(Instant::now() - start >= Duration::from_millis(300));
        assert!(Instant::now() - start < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let (scheduler, _buffer, log) = setup(None);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        // still in the bounded warm-up wait
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.reason, StopReason::Requested);
        assert!(log.lock().unwrap().writes.is_empty());
        assert!(log.lock().unwrap().stopped);
    }
}
