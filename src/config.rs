use anyhow::{bail, Context, Result};
#[cfg(test)]
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::voice::codec::{AudioParams, Codec, MAX_DECODED_SAMPLES_PER_CHANNEL};
use crate::voice::g711::{G711Law, G711};
use crate::voice::jitter::JitterBufferConfig;
use crate::voice::playout::PlayoutConfig;
use crate::voice::sequencer::SequencerConfig;
use crate::voice::samples_per_frame;

/// Sample rates the voice pipeline accepts
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    // Audio format
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u64,
    pub bitrate: u32,
    pub codec: String,

    // Receive side
    pub buffer_ms_max: u64,
    /// Warm-up target as a multiple of the frame duration
    pub warmup_frames: u32,
    pub warmup_max_wait_ms: u64,
    pub idle_timeout_ms: u64,

    // Network (binary only)
    pub bind_addr: SocketAddr,
    pub peer_addr: Option<SocketAddr>,
}

impl VoiceConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing
        Self::from_getter(|key| env::var(key).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(VoiceConfig {
            sample_rate: get("MESHVOICE_SAMPLE_RATE")
                .unwrap_or_else(|| "48000".to_string())
                .parse()
                .context("MESHVOICE_SAMPLE_RATE must be a number of Hz")?,
            channels: get("MESHVOICE_CHANNELS")
                .unwrap_or_else(|| "1".to_string())
                .parse()
                .context("MESHVOICE_CHANNELS must be 1 or 2")?,
            frame_ms: get("MESHVOICE_FRAME_MS")
                .unwrap_or_else(|| "20".to_string())
                .parse()
                .context("MESHVOICE_FRAME_MS must be a whole number of milliseconds")?,
            bitrate: get("MESHVOICE_BITRATE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(24000),
            codec: get("MESHVOICE_CODEC")
                .unwrap_or_else(|| "pcmu".to_string())
                .to_lowercase(),

            buffer_ms_max: get("MESHVOICE_BUFFER_MS_MAX")
                .and_then(|s| s.parse().ok())
                .unwrap_or(200),
            warmup_frames: get("MESHVOICE_WARMUP_FRAMES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            warmup_max_wait_ms: get("MESHVOICE_WARMUP_MAX_WAIT_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(200),
            idle_timeout_ms: get("MESHVOICE_IDLE_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3000),

            bind_addr: get("MESHVOICE_BIND_ADDR")
                .unwrap_or_else(|| "0.0.0.0:5004".to_string())
                .parse()
                .context("MESHVOICE_BIND_ADDR must be an ip:port address")?,
            peer_addr: match get("MESHVOICE_PEER_ADDR").filter(|s| !s.is_empty()) {
                Some(addr) => Some(
                    addr.parse()
                        .context("MESHVOICE_PEER_ADDR must be an ip:port address")?,
                ),
                None => None,
            },
        })
    }

    /// Create config from a HashMap (convenience for testing)
    #[cfg(test)]
    pub fn from_map(map: &HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key).map(|v| v.to_string()))
    }

    /// Validate configuration values at startup.
    /// Returns Ok(()) if all validations pass, or Err with details of what failed.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            errors.push(format!(
                "MESHVOICE_SAMPLE_RATE={} unsupported. Expected one of {:?}.",
                self.sample_rate, SUPPORTED_SAMPLE_RATES
            ));
        }

        if !(1..=2).contains(&self.channels) {
            errors.push(format!(
                "MESHVOICE_CHANNELS={} invalid. Expected 1 or 2.",
                self.channels
            ));
        }

        if !(10..=60).contains(&self.frame_ms) {
            errors.push(format!(
                "MESHVOICE_FRAME_MS={} out of range (10..=60).",
                self.frame_ms
            ));
        } else if (self.sample_rate as u64 * self.frame_ms) % 1000 != 0 {
            errors.push(format!(
                "MESHVOICE_FRAME_MS={} is not a whole number of samples at {} Hz.",
                self.frame_ms, self.sample_rate
            ));
        } else if self.samples_per_frame() > MAX_DECODED_SAMPLES_PER_CHANNEL {
            errors.push(format!(
                "MESHVOICE_FRAME_MS={} exceeds {} samples per channel.",
                self.frame_ms, MAX_DECODED_SAMPLES_PER_CHANNEL
            ));
        }

        if self.bitrate == 0 {
            errors.push("MESHVOICE_BITRATE must be greater than 0.".to_string());
        }

        if G711Law::from_name(&self.codec).is_none() {
            errors.push(format!(
                "MESHVOICE_CODEC '{}' unknown. Expected pcmu or pcma.",
                self.codec
            ));
        }

        if self.warmup_frames == 0 {
            errors.push("MESHVOICE_WARMUP_FRAMES must be at least 1.".to_string());
        }

        if self.buffer_ms_max < self.frame_ms {
            errors.push(format!(
                "MESHVOICE_BUFFER_MS_MAX={} cannot hold a single {} ms frame.",
                self.buffer_ms_max, self.frame_ms
            ));
        } else if self.buffer_max() < self.warmup_target() {
            errors.push(format!(
                "MESHVOICE_BUFFER_MS_MAX={} is below the warm-up target of {} ms.",
                self.buffer_ms_max,
                self.warmup_target().as_millis()
            ));
        }

        if self.idle_timeout_ms == 0 {
            errors.push("MESHVOICE_IDLE_TIMEOUT_MS must be greater than 0.".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }

    /// Samples per channel in one frame
    pub fn samples_per_frame(&self) -> usize {
        samples_per_frame(self.sample_rate, self.frame_duration())
    }

    /// Interleaved samples in one frame
    pub fn frame_len(&self) -> usize {
        self.samples_per_frame() * self.channels as usize
    }

    pub fn warmup_target(&self) -> Duration {
        self.frame_duration()
            .checked_mul(self.warmup_frames)
            .unwrap_or(Duration::MAX)
    }

    pub fn buffer_max(&self) -> Duration {
        Duration::from_millis(self.buffer_ms_max)
    }

    pub fn audio_params(&self) -> AudioParams {
        AudioParams {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bitrate: self.bitrate,
        }
    }

    /// Built-in codec named by `MESHVOICE_CODEC`
    pub fn build_codec(&self) -> Result<Arc<dyn Codec>> {
        let law = G711Law::from_name(&self.codec)
            .with_context(|| format!("unknown codec '{}'", self.codec))?;
        Ok(Arc::new(G711::new(law)))
    }

    pub fn jitter_config(&self) -> JitterBufferConfig {
        JitterBufferConfig {
            frame_duration: self.frame_duration(),
            max_buffered: self.buffer_max(),
        }
    }

    pub fn playout_config(&self) -> PlayoutConfig {
        PlayoutConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_duration: self.frame_duration(),
            warmup_target: self.warmup_target(),
            warmup_max_wait: Duration::from_millis(self.warmup_max_wait_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
        }
    }

    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            params: self.audio_params(),
            frame_duration: self.frame_duration(),
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn valid_env_strategy() -> impl Strategy<Value = HashMap<&'static str, String>> {
        (
            proptest::sample::select(SUPPORTED_SAMPLE_RATES.to_vec()),
            1u16..=2,
            proptest::sample::select(vec![10u64, 20, 40, 60]),
            1u32..=4,      // warm-up frames
            0u64..=400,    // extra buffer beyond warm-up
            1u64..=10_000, // idle timeout
            proptest::sample::select(vec!["pcmu", "pcma", "ulaw", "alaw"]),
        )
            .prop_map(|(rate, channels, frame, warmup, extra, idle, codec)| {
                let mut m = HashMap::new();
                m.insert("MESHVOICE_SAMPLE_RATE", rate.to_string());
                m.insert("MESHVOICE_CHANNELS", channels.to_string());
                m.insert("MESHVOICE_FRAME_MS", frame.to_string());
                m.insert("MESHVOICE_WARMUP_FRAMES", warmup.to_string());
                m.insert(
                    "MESHVOICE_BUFFER_MS_MAX",
                    (frame * warmup as u64 + extra).to_string(),
                );
                m.insert("MESHVOICE_IDLE_TIMEOUT_MS", idle.to_string());
                m.insert("MESHVOICE_CODEC", codec.to_string());
                m
            })
    }

    proptest! {
        #[test]
        fn valid_configs_validate(env in valid_env_strategy()) {
            let config = VoiceConfig::from_getter(|key| env.get(key).cloned());
            prop_assert!(config.is_ok(), "valid config should parse: {:?}", config.err());
            let config = config.unwrap();
            prop_assert!(config.validate().is_ok(), "should validate: {:?}", config.validate().err());
            prop_assert_eq!(
                config.frame_len(),
                config.sample_rate as usize * config.frame_ms as usize / 1000 * config.channels as usize
            );
        }

        #[test]
        fn parsing_never_panics(key in proptest::sample::select(vec![
            "MESHVOICE_SAMPLE_RATE",
            "MESHVOICE_CHANNELS",
            "MESHVOICE_FRAME_MS",
            "MESHVOICE_BUFFER_MS_MAX",
            "MESHVOICE_BIND_ADDR",
            "MESHVOICE_PEER_ADDR",
        ]), value in ".*") {
            let _ = VoiceConfig::from_getter(|k| (k == key).then(|| value.clone()))
                .map(|config| config.validate());
        }
    }
}
