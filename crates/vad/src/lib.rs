//! Voice activity detection: a hysteretic state machine over an opaque
//! per-chunk speech-probability oracle.
//!
//! The oracle (in production an ONNX model session) owns its own hidden
//! state; this crate only sees probabilities. Durations derive from the
//! sample clock (chunks × chunk duration), not wall time, so the machine is
//! deterministic under test.

use std::sync::Arc;

use parley_events::{Event, EventBus};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum VadError {
    #[error("oracle inference failed: {0}")]
    Inference(String),
}

pub type Result<T> = std::result::Result<T, VadError>;

/// Per-chunk speech-probability source.
///
/// Implementations carry hidden state across chunks and must drop it on
/// `reset`.
pub trait SpeechOracle: Send {
    /// Speech probability in [0, 1] for one chunk of canonical audio.
    fn probability(&mut self, chunk: &[f32]) -> Result<f32>;

    /// Clear hidden state for a fresh stream.
    fn reset(&mut self);
}

/// Degraded-mode oracle used when no model is available: never speech.
pub struct NeverSpeech;

impl SpeechOracle for NeverSpeech {
    fn probability(&mut self, _chunk: &[f32]) -> Result<f32> {
        Ok(0.0)
    }

    fn reset(&mut self) {}
}

/// Replays a fixed probability sequence; for tests and benchmarks.
#[derive(Default)]
pub struct ScriptedOracle {
    script: std::collections::VecDeque<f32>,
    pub reset_count: usize,
}

impl ScriptedOracle {
    pub fn new(probabilities: impl IntoIterator<Item = f32>) -> Self {
        Self {
            script: probabilities.into_iter().collect(),
            reset_count: 0,
        }
    }

    pub fn push(&mut self, probability: f32, chunks: usize) {
        self.script.extend(std::iter::repeat(probability).take(chunks));
    }
}

impl SpeechOracle for ScriptedOracle {
    fn probability(&mut self, _chunk: &[f32]) -> Result<f32> {
        Ok(self.script.pop_front().unwrap_or(0.0))
    }

    fn reset(&mut self) {
        self.reset_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    NotSpeaking,
    Speaking,
    SilenceAfterSpeech,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    /// Probabilities strictly above this count as speech.
    #[serde(alias = "vad_threshold")]
    pub threshold: f32,
    #[serde(alias = "vad_min_speech_duration_ms")]
    pub min_speech_duration_ms: u64,
    /// Cumulative silence required before heartbeats start.
    #[serde(alias = "vad_min_silence_duration_ms")]
    pub min_silence_duration_ms: u64,
    /// Consecutive speech chunks required to enter (or re-enter) SPEAKING.
    pub speech_start_chunks: u32,
    /// Consecutive silence chunks required to leave SPEAKING.
    pub speech_end_chunks: u32,
    pub chunk_duration_ms: u64,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_speech_duration_ms: 250,
            min_silence_duration_ms: 300,
            speech_start_chunks: 3,
            speech_end_chunks: 5,
            chunk_duration_ms: 30,
        }
    }
}

/// The VAD state machine. Consumes fixed-size chunks, asks the oracle for a
/// probability, and emits speech/silence events on the bus.
///
/// While in SILENCE_AFTER_SPEECH every chunk past the minimum silence emits
/// a fresh SILENCE_DETECTED heartbeat carrying the grown duration; the turn
/// detector and backchannel trigger need that cadence for graded decisions,
/// so it must not be collapsed into a single edge.
pub struct VadProcessor {
    settings: VadSettings,
    bus: Arc<EventBus>,
    oracle: Box<dyn SpeechOracle>,
    state: VadState,
    clock_ms: u64,
    speech_start_ms: Option<u64>,
    silence_start_ms: Option<u64>,
    last_speech_duration_ms: u64,
    consecutive_speech: u32,
    consecutive_silence: u32,
}

impl VadProcessor {
    pub fn new(settings: VadSettings, oracle: Box<dyn SpeechOracle>, bus: Arc<EventBus>) -> Self {
        Self {
            settings,
            bus,
            oracle,
            state: VadState::NotSpeaking,
            clock_ms: 0,
            speech_start_ms: None,
            silence_start_ms: None,
            last_speech_duration_ms: 0,
            consecutive_speech: 0,
            consecutive_silence: 0,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Stream-clock milliseconds of audio processed so far.
    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    pub fn speech_duration_ms(&self) -> u64 {
        self.speech_start_ms
            .map_or(0, |start| self.clock_ms.saturating_sub(start))
    }

    pub fn silence_duration_ms(&self) -> u64 {
        self.silence_start_ms
            .map_or(0, |start| self.clock_ms.saturating_sub(start))
    }

    /// Process one chunk and return its speech probability.
    ///
    /// Oracle failures degrade to silence rather than propagating; a broken
    /// model must not take the conversation down.
    pub fn process_chunk(&mut self, chunk: &[f32]) -> f32 {
        let probability = match self.oracle.probability(chunk) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "oracle inference failed, treating chunk as silence");
                0.0
            }
        };

        self.clock_ms += self.settings.chunk_duration_ms;
        self.update_state(probability);
        probability
    }

    fn update_state(&mut self, probability: f32) {
        let is_speech = probability > self.settings.threshold;
        if is_speech {
            self.consecutive_speech += 1;
            self.consecutive_silence = 0;
        } else {
            self.consecutive_silence += 1;
            self.consecutive_speech = 0;
        }

        match self.state {
            VadState::NotSpeaking => {
                if self.consecutive_speech >= self.settings.speech_start_chunks {
                    self.enter_speaking(probability, false);
                }
            }
            VadState::Speaking => {
                if is_speech {
                    self.bus.emit(Event::SpeechContinuing {
                        ts_ms: self.clock_ms,
                        speech_duration_ms: self.speech_duration_ms(),
                        probability,
                    });
                } else if self.consecutive_silence >= self.settings.speech_end_chunks {
                    self.state = VadState::SilenceAfterSpeech;
                    self.silence_start_ms = Some(self.clock_ms);
                    self.last_speech_duration_ms = self.speech_duration_ms();
                    tracing::debug!(
                        speech_duration_ms = self.last_speech_duration_ms,
                        "speech_to_silence_edge"
                    );
                    self.bus.emit(Event::SilenceDetected {
                        ts_ms: self.clock_ms,
                        speech_duration_ms: self.last_speech_duration_ms,
                        silence_duration_ms: 0,
                        probability,
                    });
                }
            }
            VadState::SilenceAfterSpeech => {
                if self.consecutive_speech >= self.settings.speech_start_chunks {
                    self.enter_speaking(probability, true);
                } else {
                    let silence_duration_ms = self.silence_duration_ms();
                    if silence_duration_ms >= self.settings.min_silence_duration_ms {
                        self.bus.emit(Event::SilenceDetected {
                            ts_ms: self.clock_ms,
                            speech_duration_ms: self.last_speech_duration_ms,
                            silence_duration_ms,
                            probability,
                        });
                    }
                }
            }
        }
    }

    fn enter_speaking(&mut self, probability: f32, resumed: bool) {
        self.state = VadState::Speaking;
        self.speech_start_ms = Some(self.clock_ms);
        self.silence_start_ms = None;
        tracing::debug!(ts_ms = self.clock_ms, resumed, "speech_started");
        self.bus.emit(Event::SpeechStarted {
            ts_ms: self.clock_ms,
            probability,
            resumed,
        });
    }

    /// Reset the machine and the oracle's hidden state.
    pub fn reset(&mut self) {
        self.state = VadState::NotSpeaking;
        self.speech_start_ms = None;
        self.silence_start_ms = None;
        self.last_speech_duration_ms = 0;
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.oracle.reset();
    }
}
