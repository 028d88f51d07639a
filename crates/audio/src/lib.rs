//! Audio plumbing: sample-format conversion, the ingress buffering
//! pipeline that feeds VAD and transcription, and the two-channel output
//! mixer.
//!
//! Everything downstream of this crate works in the canonical format: mono
//! 16 kHz 32-bit float in [-1, 1]. Foreign rates and channel layouts are
//! folded in at the boundary.

pub mod convert;
mod mixer;
mod pipeline;

pub use mixer::AudioMixer;
pub use pipeline::{AudioPipeline, AudioSettings, BufferLevels};

/// Canonical internal sample rate.
pub const SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("resampler unavailable: {0}")]
    Resampler(String),
    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),
}

pub type Result<T> = std::result::Result<T, AudioError>;
