//! Multi-signal turn detection.
//!
//! Every silence heartbeat gets scored on three axes (how long the pause
//! has run, how finished the words sound, and what the conversation context
//! suggests) and the weighted fusion decides whether the user has yielded
//! the floor.

use std::sync::Arc;

use parley_conversation::ConversationManager;
use parley_events::{ConversationState, Event, EventBus};
use parley_language::{LanguageSettings, LinguisticAnalyzer};
use serde::Deserialize;

/// Pauses between the short and medium thresholds read as hesitation.
const HESITATION_PAUSE_MS: u64 = 700;

/// Fused scores must clear this to even enter the uncertain band.
const EVALUATION_FLOOR: f32 = 40.0;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    pub short_pause_ms: u64,
    pub medium_pause_ms: u64,
    pub long_pause_ms: u64,
    pub turn_end_score_threshold: f32,
    pub silence_weight: f32,
    pub linguistic_weight: f32,
    pub context_weight: f32,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            short_pause_ms: 400,
            medium_pause_ms: 1000,
            long_pause_ms: 1500,
            turn_end_score_threshold: 65.0,
            silence_weight: 0.40,
            linguistic_weight: 0.35,
            context_weight: 0.25,
        }
    }
}

impl TurnSettings {
    pub fn weight_sum(&self) -> f32 {
        self.silence_weight + self.linguistic_weight + self.context_weight
    }

    /// The three weights must sum to 1.0 within ±0.01.
    pub fn weights_are_normalized(&self) -> bool {
        (self.weight_sum() - 1.0).abs() <= 0.01
    }
}

/// Component and fused scores for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TurnScores {
    pub silence: u32,
    pub linguistic: u32,
    pub context: u32,
    pub final_score: f32,
}

/// Outcome of one silence evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDecision {
    /// Not evaluated: the user does not currently hold the floor.
    Skipped,
    /// Score too low; the user is still going.
    Continuation,
    /// Uncertain band; park in EVALUATING_PAUSE.
    Evaluating,
    /// Turn over; the agent takes the floor.
    TurnEnded,
}

pub struct TurnDetector {
    settings: TurnSettings,
    analyzer: LinguisticAnalyzer,
    conversation: Arc<ConversationManager>,
    bus: Arc<EventBus>,
}

impl TurnDetector {
    pub fn new(
        settings: TurnSettings,
        language: &LanguageSettings,
        conversation: Arc<ConversationManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            analyzer: LinguisticAnalyzer::new(language),
            conversation,
            bus,
        }
    }

    /// Evaluate one SILENCE_DETECTED heartbeat.
    ///
    /// Evaluation continues while the pause is being weighed: a turn parked
    /// in EVALUATING_PAUSE must still be able to end once the silence grows,
    /// or it would never end at all.
    pub fn on_silence(&self, silence_duration_ms: u64, ts_ms: u64) -> TurnDecision {
        if !matches!(
            self.conversation.state(),
            ConversationState::UserSpeaking | ConversationState::EvaluatingPause
        ) {
            return TurnDecision::Skipped;
        }

        self.conversation.update_silence_duration(silence_duration_ms);

        let transcript = self.conversation.current_turn_transcript();
        let scores = self.score(&transcript, silence_duration_ms, ts_ms);

        self.bus.emit(Event::TurnEvaluation {
            ts_ms,
            silence_score: scores.silence,
            linguistic_score: scores.linguistic,
            context_score: scores.context,
            final_score: scores.final_score,
            silence_duration_ms,
            transcript: transcript.clone(),
        });

        tracing::debug!(
            silence = scores.silence,
            linguistic = scores.linguistic,
            context = scores.context,
            final_score = scores.final_score,
            "turn_evaluation"
        );

        if scores.final_score > self.settings.turn_end_score_threshold {
            self.conversation
                .update_state(ConversationState::AgentThinking, ts_ms);
            self.bus.emit(Event::TurnEnded {
                ts_ms,
                final_score: scores.final_score,
                silence_score: scores.silence,
                linguistic_score: scores.linguistic,
                context_score: scores.context,
                transcript,
                silence_duration_ms,
            });
            TurnDecision::TurnEnded
        } else if scores.final_score > EVALUATION_FLOOR {
            self.conversation
                .update_state(ConversationState::EvaluatingPause, ts_ms);
            TurnDecision::Evaluating
        } else {
            TurnDecision::Continuation
        }
    }

    fn score(&self, transcript: &str, silence_duration_ms: u64, now_ms: u64) -> TurnScores {
        let silence = self.silence_score(silence_duration_ms);
        let linguistic = if transcript.is_empty() {
            0
        } else {
            self.analyzer.analyze(transcript).completeness_score
        };
        let context = self.context_score(now_ms);

        let final_score = self.settings.silence_weight * silence as f32
            + self.settings.linguistic_weight * linguistic as f32
            + self.settings.context_weight * context as f32;

        TurnScores {
            silence,
            linguistic,
            context,
            final_score,
        }
    }

    /// Step function over the pause length.
    pub fn silence_score(&self, duration_ms: u64) -> u32 {
        if duration_ms < self.settings.short_pause_ms {
            10
        } else if duration_ms < HESITATION_PAUSE_MS {
            20
        } else if duration_ms < self.settings.medium_pause_ms {
            50
        } else if duration_ms < self.settings.long_pause_ms {
            80
        } else {
            100
        }
    }

    /// Conversation-context prior: how likely is this speaker done, given
    /// how long and how much they have been talking.
    fn context_score(&self, now_ms: u64) -> u32 {
        let snapshot = self.conversation.snapshot();
        let mut score: i32 = 50;

        let speaking_ms = snapshot.speaking_duration_ms(now_ms);
        if speaking_ms > 15_000 {
            score += 20;
        } else if speaking_ms < 2_000 {
            score -= 10;
        }

        if snapshot.word_count_current_turn < 5 {
            score -= 20;
        }
        if snapshot.sentence_count_current_turn >= 2 {
            score += 10;
        }

        score.clamp(0, 100) as u32
    }
}
