//! Backchannels: short spoken acknowledgements ("mm-hmm", "right") played
//! while the user still holds the floor.
//!
//! The pipeline is staged over the event bus: the [`TriggerDetector`]
//! decides that a pause is backchannel-worthy, the [`BackchannelSelector`]
//! picks which clip fits, the [`TimingController`] holds it through a short
//! safe zone in case the user resumes, and the [`BackchannelPlayer`]
//! commits audio to the mixer's secondary channel. None of the stages ever
//! touches conversation state; the user is still considered speaking.

mod library;
mod player;
mod selector;
mod timing;
mod trigger;

pub use library::BackchannelLibrary;
pub use player::BackchannelPlayer;
pub use selector::BackchannelSelector;
pub use timing::TimingController;
pub use trigger::TriggerDetector;

pub use parley_events::BackchannelKind;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum BackchannelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wav decode failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("{path}: expected mono 16 kHz 16-bit PCM, got {detail}")]
    BadFormat { path: String, detail: String },
    #[error("library is missing clips: {0:?}")]
    MissingClips(Vec<BackchannelKind>),
}

pub type Result<T> = std::result::Result<T, BackchannelError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackchannelSettings {
    /// Starting probability before contextual modifiers.
    #[serde(alias = "backchannel_base_probability")]
    pub base_probability: f64,
    /// Minimum spacing between played backchannels.
    #[serde(alias = "backchannel_min_interval_s")]
    pub min_interval_s: f64,
    /// How long a selected backchannel waits for the user to resume before
    /// it actually plays.
    #[serde(alias = "backchannel_safe_zone_ms")]
    pub safe_zone_ms: u64,
    /// Amplitude scale applied to library clips.
    #[serde(alias = "backchannel_volume")]
    pub volume: f32,
    pub emotion_keywords: Vec<String>,
    pub explicit_prompts: Vec<String>,
}

impl Default for BackchannelSettings {
    fn default() -> Self {
        Self {
            base_probability: 0.4,
            min_interval_s: 5.0,
            safe_zone_ms: 300,
            volume: 0.5,
            emotion_keywords: [
                "amazing",
                "terrible",
                "wonderful",
                "awful",
                "excited",
                "frustrated",
                "happy",
                "sad",
                "angry",
                "love",
                "hate",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            explicit_prompts: [
                "you know?",
                "right?",
                "don't you think?",
                "isn't it?",
                "you see?",
                "understand?",
                "make sense?",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl BackchannelSettings {
    pub fn min_interval_ms(&self) -> u64 {
        (self.min_interval_s * 1000.0) as u64
    }
}
