//! Shared event contracts for cross-component communication.
//!
//! This crate defines the closed set of events that flow between the
//! engine's components, plus the contract types that appear inside event
//! payloads. Using shared types prevents drift between producers and
//! consumers.
//!
//! Also provides the [`EventBus`] used to deliver them.

mod bus;

pub use bus::{EventBus, HistoryEntry, DEFAULT_HISTORY_SIZE};

use serde::{Deserialize, Serialize};

/// Which party produced a transcript segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// Global conversation state. Only the conversation manager mutates it;
/// everything else holds read-only views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    UserSpeaking,
    EvaluatingPause,
    AgentThinking,
    AgentSpeaking,
}

impl ConversationState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// `AgentThinking -> Idle` covers the short-circuit paths (empty LLM
    /// output, failed synthesis) where the turn ends with no spoken reply.
    pub fn can_transition_to(self, next: ConversationState) -> bool {
        use ConversationState::*;
        matches!(
            (self, next),
            (Idle, UserSpeaking)
                | (UserSpeaking, EvaluatingPause)
                | (UserSpeaking, AgentThinking)
                | (EvaluatingPause, AgentThinking)
                | (EvaluatingPause, UserSpeaking)
                | (AgentThinking, AgentSpeaking)
                | (AgentThinking, Idle)
                | (AgentSpeaking, Idle)
        )
    }
}

/// One of the pre-recorded acknowledgement clips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackchannelKind {
    Mmhmm,
    Okay,
    Yeah,
    ISee,
    Right,
}

impl BackchannelKind {
    pub const ALL: [BackchannelKind; 5] = [
        BackchannelKind::Mmhmm,
        BackchannelKind::Okay,
        BackchannelKind::Yeah,
        BackchannelKind::ISee,
        BackchannelKind::Right,
    ];

    /// Stable name, also the stem of the library's WAV file.
    pub fn as_str(self) -> &'static str {
        match self {
            BackchannelKind::Mmhmm => "mmhmm",
            BackchannelKind::Okay => "okay",
            BackchannelKind::Yeah => "yeah",
            BackchannelKind::ISee => "i_see",
            BackchannelKind::Right => "right",
        }
    }

    /// Parse from a WAV file stem.
    pub fn from_stem(stem: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == stem)
    }
}

impl std::fmt::Display for BackchannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant for subscription and history filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AudioChunkReceived,
    SpeechStarted,
    SpeechContinuing,
    SilenceDetected,
    SpeechEnded,
    PartialTranscript,
    FinalTranscript,
    TurnEvaluation,
    TurnEnded,
    BackchannelTriggered,
    BackchannelPlayed,
    BackchannelAborted,
    ResponseGenerating,
    ResponseStarted,
    ResponseChunk,
    ResponseEnded,
    StateChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        EventKind::AudioChunkReceived,
        EventKind::SpeechStarted,
        EventKind::SpeechContinuing,
        EventKind::SilenceDetected,
        EventKind::SpeechEnded,
        EventKind::PartialTranscript,
        EventKind::FinalTranscript,
        EventKind::TurnEvaluation,
        EventKind::TurnEnded,
        EventKind::BackchannelTriggered,
        EventKind::BackchannelPlayed,
        EventKind::BackchannelAborted,
        EventKind::ResponseGenerating,
        EventKind::ResponseStarted,
        EventKind::ResponseChunk,
        EventKind::ResponseEnded,
        EventKind::StateChanged,
    ];
}

/// Every event in the system, as one closed tagged set.
///
/// `ts_ms` is the audio stream clock: milliseconds of audio ingested since
/// the connection opened. Durations are derived from it so behavior is
/// deterministic under test.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    AudioChunkReceived {
        ts_ms: u64,
        samples: usize,
        duration_ms: u64,
    },
    SpeechStarted {
        ts_ms: u64,
        probability: f32,
        /// True when speech resumed out of a post-speech silence.
        resumed: bool,
    },
    SpeechContinuing {
        ts_ms: u64,
        speech_duration_ms: u64,
        probability: f32,
    },
    /// Emitted once at the speech-to-silence edge (with the speech span's
    /// duration), then re-emitted per chunk as a heartbeat once cumulative
    /// silence reaches the configured minimum. Downstream deciders rely on
    /// the growing `silence_duration_ms`.
    SilenceDetected {
        ts_ms: u64,
        speech_duration_ms: u64,
        silence_duration_ms: u64,
        probability: f32,
    },
    SpeechEnded {
        ts_ms: u64,
        speech_duration_ms: u64,
    },
    PartialTranscript {
        ts_ms: u64,
        text: String,
    },
    FinalTranscript {
        ts_ms: u64,
        text: String,
    },
    TurnEvaluation {
        ts_ms: u64,
        silence_score: u32,
        linguistic_score: u32,
        context_score: u32,
        final_score: f32,
        silence_duration_ms: u64,
        transcript: String,
    },
    TurnEnded {
        ts_ms: u64,
        final_score: f32,
        silence_score: u32,
        linguistic_score: u32,
        context_score: u32,
        transcript: String,
        silence_duration_ms: u64,
    },
    /// Staged: the trigger emits it bare, the selector re-emits it with
    /// `backchannel` filled in, the timing controller re-emits it with
    /// `proceed_to_play` once the safe zone elapses.
    BackchannelTriggered {
        ts_ms: u64,
        trigger_strength: f32,
        silence_duration_ms: u64,
        backchannel: Option<BackchannelKind>,
        proceed_to_play: bool,
    },
    BackchannelPlayed {
        ts_ms: u64,
        backchannel: BackchannelKind,
        duration_ms: u64,
    },
    BackchannelAborted {
        ts_ms: u64,
        backchannel: BackchannelKind,
        reason: String,
    },
    ResponseGenerating {
        ts_ms: u64,
        user_utterance: String,
    },
    ResponseStarted {
        ts_ms: u64,
        text: String,
        audio_duration_ms: u64,
    },
    ResponseChunk {
        ts_ms: u64,
        chunk: String,
    },
    ResponseEnded {
        ts_ms: u64,
        text: String,
    },
    StateChanged {
        ts_ms: u64,
        old: ConversationState,
        new: ConversationState,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AudioChunkReceived { .. } => EventKind::AudioChunkReceived,
            Event::SpeechStarted { .. } => EventKind::SpeechStarted,
            Event::SpeechContinuing { .. } => EventKind::SpeechContinuing,
            Event::SilenceDetected { .. } => EventKind::SilenceDetected,
            Event::SpeechEnded { .. } => EventKind::SpeechEnded,
            Event::PartialTranscript { .. } => EventKind::PartialTranscript,
            Event::FinalTranscript { .. } => EventKind::FinalTranscript,
            Event::TurnEvaluation { .. } => EventKind::TurnEvaluation,
            Event::TurnEnded { .. } => EventKind::TurnEnded,
            Event::BackchannelTriggered { .. } => EventKind::BackchannelTriggered,
            Event::BackchannelPlayed { .. } => EventKind::BackchannelPlayed,
            Event::BackchannelAborted { .. } => EventKind::BackchannelAborted,
            Event::ResponseGenerating { .. } => EventKind::ResponseGenerating,
            Event::ResponseStarted { .. } => EventKind::ResponseStarted,
            Event::ResponseChunk { .. } => EventKind::ResponseChunk,
            Event::ResponseEnded { .. } => EventKind::ResponseEnded,
            Event::StateChanged { .. } => EventKind::StateChanged,
        }
    }

    /// Stream-clock timestamp carried by every variant.
    pub fn ts_ms(&self) -> u64 {
        match self {
            Event::AudioChunkReceived { ts_ms, .. }
            | Event::SpeechStarted { ts_ms, .. }
            | Event::SpeechContinuing { ts_ms, .. }
            | Event::SilenceDetected { ts_ms, .. }
            | Event::SpeechEnded { ts_ms, .. }
            | Event::PartialTranscript { ts_ms, .. }
            | Event::FinalTranscript { ts_ms, .. }
            | Event::TurnEvaluation { ts_ms, .. }
            | Event::TurnEnded { ts_ms, .. }
            | Event::BackchannelTriggered { ts_ms, .. }
            | Event::BackchannelPlayed { ts_ms, .. }
            | Event::BackchannelAborted { ts_ms, .. }
            | Event::ResponseGenerating { ts_ms, .. }
            | Event::ResponseStarted { ts_ms, .. }
            | Event::ResponseChunk { ts_ms, .. }
            | Event::ResponseEnded { ts_ms, .. }
            | Event::StateChanged { ts_ms, .. } => *ts_ms,
        }
    }
}
