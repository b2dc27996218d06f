//! Voice session orchestration
//!
//! Wires one capture/encode producer, one delivery producer and one playout
//! consumer around a shared jitter buffer. Start is all-or-nothing; stop
//! always interrupts the scheduler, halts capture, releases codec and device
//! handles, and clears the buffer.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::VoiceConfig;
use crate::transport::{Delivery, Transport};
use crate::voice::codec::{Codec, CodecError};
use crate::voice::device::{CaptureDevice, DeviceError, RenderDevice};
use crate::voice::jitter::{JitterBufferStats, SharedJitterBuffer};
use crate::voice::playout::{PlaybackScheduler, PlayoutReport, PlayoutState, StopReason};
use crate::voice::sequencer::{FrameSequencer, SequencerReport};

/// Reasons a session could not start. Nothing is left running on error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create encode session: {0}")]
    Codec(#[source] CodecError),

    #[error("failed to start capture device: {0}")]
    Capture(#[source] DeviceError),

    #[error("failed to start render device: {0}")]
    Render(#[source] DeviceError),
}

/// Where outgoing frames go and where incoming ones come from
pub struct Endpoint<T: Transport, D: Delivery> {
    pub transport: Arc<T>,
    pub destination: T::Destination,
    pub inbound: D,
}

pub struct AudioDevices {
    pub capture: Box<dyn CaptureDevice>,
    pub render: Box<dyn RenderDevice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub elapsed_ms: u64,
    /// Missing if the task panicked
    pub sequencer: Option<SequencerReport>,
    pub playout: Option<PlayoutReport>,
    pub frames_delivered: u64,
    pub jitter: JitterBufferStats,
}

pub struct VoiceSession {
    cancel: CancellationToken,
    buffer: Arc<SharedJitterBuffer>,
    playout_state: watch::Receiver<PlayoutState>,
    sequencer: JoinHandle<SequencerReport>,
    delivery: JoinHandle<u64>,
    playout: JoinHandle<PlayoutReport>,
    started_at: Instant,
}

impl VoiceSession {
    /// Start a session. Must be called from within a tokio runtime.
    pub fn start<T, D>(
        config: &VoiceConfig,
        codec: Arc<dyn Codec>,
        endpoint: Endpoint<T, D>,
        devices: AudioDevices,
    ) -> Result<Self, SessionError>
    where
        T: Transport,
        D: Delivery,
    {
        let AudioDevices {
            mut capture,
            mut render,
        } = devices;

        let encoder = codec
            .create_encode_session(config.audio_params())
            .map_err(SessionError::Codec)?;
        capture.start().map_err(SessionError::Capture)?;
        if let Err(e) = render.start() {
            capture.stop();
            return Err(SessionError::Render(e));
        }

        let cancel = CancellationToken::new();
        let buffer = Arc::new(SharedJitterBuffer::new(config.jitter_config()));

        let scheduler = PlaybackScheduler::new(
            config.playout_config(),
            Arc::clone(&buffer),
            Arc::clone(&codec),
            render,
        );
        let playout_state = scheduler.subscribe();
        let playout = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let report = scheduler.run(cancel.clone()).await;
                // Idle timeout or a dead render device ends the whole session
                cancel.cancel();
                report
            })
        };

        let sequencer = FrameSequencer::new(
            config.sequencer_config(),
            Arc::clone(&codec),
            encoder,
            capture,
            endpoint.transport,
            endpoint.destination,
        );
        let sequencer = {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                let report = sequencer.run_blocking(&cancel);
                if report.reason == StopReason::DeviceFailure {
                    cancel.cancel();
                }
                report
            })
        };

        let delivery = tokio::spawn(
            endpoint
                .inbound
                .deliver_into(Arc::clone(&buffer), cancel.clone()),
        );

        info!(
            "Voice session started: {} {} Hz x{} in {} ms frames",
            codec.name(),
            config.sample_rate,
            config.channels,
            config.frame_ms
        );

        Ok(Self {
            cancel,
            buffer,
            playout_state,
            sequencer,
            delivery,
            playout,
            started_at: Instant::now(),
        })
    }

    pub fn playout_state(&self) -> PlayoutState {
        *self.playout_state.borrow()
    }

    pub fn jitter_stats(&self) -> JitterBufferStats {
        self.buffer.stats()
    }

    /// True once stop was requested or a task ended the session on its own
    pub fn is_ended(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when a task ends the session on its own (idle timeout or
    /// device failure)
    pub async fn ended(&self) {
        self.cancel.cancelled().await;
    }

    /// Run until `shutdown` resolves or the session ends on its own, then stop
    pub async fn run_until<F>(self, shutdown: F) -> SessionReport
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => info!("Shutdown requested"),
            _ = self.cancel.cancelled() => info!("Session ended"),
        }
        self.stop().await
    }

    /// Stop every task, wait for them, and clear the buffer
    pub async fn stop(self) -> SessionReport {
        self.cancel.cancel();

        let playout = match self.playout.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Playout task failed: {}", e);
                None
            }
        };
        let sequencer = match self.sequencer.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Sequencer task failed: {}", e);
                None
            }
        };
        let frames_delivered = match self.delivery.await {
            Ok(count) => count,
            Err(e) => {
                error!("Delivery task failed: {}", e);
                0
            }
        };

        let jitter = self.buffer.stats();
        self.buffer.clear();

        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        info!(
            "Voice session stopped after {} ms: {} frames delivered, {} played",
            elapsed_ms,
            frames_delivered,
            playout.as_ref().map_or(0, |p| p.stats.frames_played)
        );

        SessionReport {
            elapsed_ms,
            sequencer,
            playout,
            frames_delivered,
            jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{loopback, Impairment};
    use crate::voice::codec::{AudioParams, EncodeSession};
    use crate::voice::device::{MeteredRender, ToneCapture};
    use crate::voice::g711::{G711Law, G711};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_config() -> VoiceConfig {
        let mut config = VoiceConfig::from_getter(|_| None).unwrap();
        config.sample_rate = 8000;
        config.frame_ms = 20;
        config
    }

    struct NoEncoder;

    impl Codec for NoEncoder {
        fn name(&self) -> &'static str {
            "none"
        }

        fn create_encode_session(
            &self,
            _params: AudioParams,
        ) -> Result<Box<dyn EncodeSession>, CodecError> {
            Err(CodecError::SessionUnavailable)
        }

        fn decode(&self, _payload: &[u8], _rate: u32, _channels: u16) -> Result<Vec<i16>, CodecError> {
            Ok(Vec::new())
        }
    }

    /// Capture whose `start` and `stop` are observable
    struct WatchedCapture {
        started: Arc<AtomicBool>,
    }

    impl CaptureDevice for WatchedCapture {
        fn start(&mut self) -> Result<(), DeviceError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn read(&mut self, _buf: &mut [i16]) -> Result<usize, DeviceError> {
            Err(DeviceError::Closed)
        }

        fn stop(&mut self) {
            self.started.store(false, Ordering::SeqCst);
        }
    }

    struct BrokenRender;

    impl RenderDevice for BrokenRender {
        fn start(&mut self) -> Result<(), DeviceError> {
            Err(DeviceError::Unavailable("no output device".into()))
        }

        fn write(&mut self, _samples: &[i16]) -> Result<usize, DeviceError> {
            Err(DeviceError::Closed)
        }

        fn stop(&mut self) {}
    }

    fn endpoint() -> Endpoint<crate::transport::LoopbackTransport, crate::transport::LoopbackInbox> {
        let (transport, inbox) = loopback(Impairment::none());
        Endpoint {
            transport: Arc::new(transport),
            destination: (),
            inbound: inbox,
        }
    }

    #[tokio::test]
    async fn test_start_fails_without_encoder() {
        let started = Arc::new(AtomicBool::new(false));
        let (render, _meter) = MeteredRender::new();
        let result = VoiceSession::start(
            &test_config(),
            Arc::new(NoEncoder),
            endpoint(),
            AudioDevices {
                capture: Box::new(WatchedCapture {
                    started: Arc::clone(&started),
                }),
                render: Box::new(render),
            },
        );

        assert!(matches!(result, Err(SessionError::Codec(_))));
        // the capture device was never touched
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_render_failure_releases_capture() {
        let started = Arc::new(AtomicBool::new(false));
        let result = VoiceSession::start(
            &test_config(),
            Arc::new(G711::new(G711Law::ULaw)),
            endpoint(),
            AudioDevices {
                capture: Box::new(WatchedCapture {
                    started: Arc::clone(&started),
                }),
                render: Box::new(BrokenRender),
            },
        );

        assert!(matches!(result, Err(SessionError::Render(_))));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_capture_failure_ends_session() {
        let started = Arc::new(AtomicBool::new(false));
        let (render, _meter) = MeteredRender::new();
        let session = VoiceSession::start(
            &test_config(),
            Arc::new(G711::new(G711Law::ULaw)),
            endpoint(),
            AudioDevices {
                capture: Box::new(WatchedCapture {
                    started: Arc::clone(&started),
                }),
                render: Box::new(render),
            },
        )
        .expect("session should start");

        tokio::time::timeout(std::time::Duration::from_secs(2), session.ended())
            .await
            .expect("capture failure should end the session");
        let report = session.stop().await;

        assert_eq!(
            report.sequencer.map(|s| s.reason),
            Some(StopReason::DeviceFailure)
        );
        assert_eq!(report.playout.map(|p| p.reason), Some(StopReason::Requested));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_loopback_session_plays_tone() {
        let (render, meter) = MeteredRender::new();
        let session = VoiceSession::start(
            &test_config(),
            Arc::new(G711::new(G711Law::ALaw)),
            endpoint(),
            AudioDevices {
                capture: Box::new(ToneCapture::new(8000, 1, 440.0)),
                render: Box::new(render),
            },
        )
        .expect("session should start");

        let report = session
            .run_until(tokio::time::sleep(std::time::Duration::from_millis(300)))
            .await;

        let playout = report.playout.expect("playout report");
        assert_eq!(playout.reason, StopReason::Requested);
        assert!(playout.stats.frames_played > 0);
        assert!(report.frames_delivered > 0);
        assert_eq!(report.jitter.duplicates, 0);
        assert!(meter.writes() > 0);
        // every write is exactly one 20 ms frame at 8 kHz
        assert_eq!(meter.samples(), meter.writes() * 160);
    }
}
