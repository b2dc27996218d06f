//! meshvoice - live voice over a lossy mesh transport
//!
//! Send side: [`voice::sequencer::FrameSequencer`] slices capture audio into
//! sequenced, encoded frames. Receive side: [`voice::jitter::SharedJitterBuffer`]
//! reorders and bounds arrivals, [`voice::playout::PlaybackScheduler`] drains
//! them at real-time cadence. [`session::VoiceSession`] ties the three
//! execution contexts together.

pub mod cli;
pub mod config;
pub mod session;
pub mod transport;
pub mod voice;
