//! Engine-wide configuration: per-crate settings aggregated into one
//! JSON-loadable document, validated fatally at startup.

use std::path::Path;

use parley_audio::AudioSettings;
use parley_backchannel::BackchannelSettings;
use parley_language::LanguageSettings;
use parley_turn::TurnSettings;
use parley_vad::VadSettings;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Response-generation knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResponseSettings {
    /// System prompt constraining replies to short spoken turns.
    pub system_prompt: String,
    /// How many trailing conversation-log lines go to the model.
    pub history_lines: usize,
    /// Network retry policy shared by STT/TTS/LLM calls.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Spoken when generation fails outright.
    pub apology: String,
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful voice assistant. Keep responses concise and \
                            natural, suitable for voice conversation. Limit to 2-3 sentences. \
                            Be conversational and friendly."
                .to_string(),
            history_lines: 10,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            apology: "I'm sorry, I encountered an error generating a response.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioSettings,
    pub vad: VadSettings,
    pub language: LanguageSettings,
    pub turn: TurnSettings,
    pub backchannel: BackchannelSettings,
    pub response: ResponseSettings,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Startup validation; any violation here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.turn.weights_are_normalized() {
            return Err(ConfigError::Invalid(format!(
                "scoring weights must sum to 1.0 +/- 0.01, got {:.3}",
                self.turn.weight_sum()
            )));
        }

        for (name, value) in [
            ("vad.threshold", self.vad.threshold as f64),
            (
                "backchannel.base_probability",
                self.backchannel.base_probability,
            ),
            ("backchannel.volume", self.backchannel.volume as f64),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }

        if self.audio.sample_rate == 0 || self.audio.chunk_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "audio sample rate and chunk duration must be non-zero".to_string(),
            ));
        }
        if self.audio.transcriber_overlap_s >= self.audio.transcriber_chunk_duration_s {
            return Err(ConfigError::Invalid(
                "transcriber overlap must be shorter than the chunk".to_string(),
            ));
        }
        if self.vad.chunk_duration_ms != self.audio.chunk_duration_ms {
            return Err(ConfigError::Invalid(
                "vad and audio chunk durations must agree".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_skewed_weights_are_fatal() {
        let json = r#"{"turn": {"silence_weight": 0.7}}"#;
        let error = EngineConfig::from_json_str(json).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_weight_tolerance_band() {
        // 0.41 + 0.35 + 0.25 = 1.01, inside the +/- 0.01 band.
        let json = r#"{"turn": {"silence_weight": 0.41}}"#;
        assert!(EngineConfig::from_json_str(json).is_ok());
    }

    #[test]
    fn test_out_of_range_probability_is_fatal() {
        let json = r#"{"backchannel": {"backchannel_base_probability": 1.4}}"#;
        assert!(EngineConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_original_key_aliases_accepted() {
        let json = r#"{
            "audio": {"whisper_chunk_duration_s": 2.0, "whisper_overlap_s": 0.5},
            "vad": {"vad_threshold": 0.6},
            "backchannel": {"backchannel_volume": 0.4}
        }"#;
        let config = EngineConfig::from_json_str(json).unwrap();
        assert_eq!(config.audio.transcriber_chunk_samples(), 32_000);
        assert!((config.vad.threshold - 0.6).abs() < 1e-6);
        assert!((config.backchannel.volume - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_overlap_must_fit_inside_chunk() {
        let json = r#"{"audio": {"whisper_chunk_duration_s": 0.4, "whisper_overlap_s": 0.5}}"#;
        assert!(EngineConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
