//! Backchannel trigger detection: is this pause worth acknowledging?

use std::sync::{Arc, Mutex};

use parley_conversation::ConversationManager;
use parley_events::{ConversationState, Event, EventBus};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::BackchannelSettings;

/// Pause window that invites a backchannel: long enough to register, short
/// enough that the floor has not actually been yielded.
const TRIGGER_MIN_SILENCE_MS: u64 = 300;
const TRIGGER_MAX_SILENCE_MS: u64 = 700;

/// Within this of the previous backchannel the probability drops.
const RECENT_BACKCHANNEL_MS: u64 = 8_000;

/// Speakers who just started are not ready to be acknowledged.
const MIN_SPEAKING_MS: u64 = 3_000;

pub struct TriggerDetector {
    settings: BackchannelSettings,
    conversation: Arc<ConversationManager>,
    bus: Arc<EventBus>,
    rng: Mutex<StdRng>,
}

impl TriggerDetector {
    pub fn new(
        settings: BackchannelSettings,
        conversation: Arc<ConversationManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            conversation,
            bus,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(
        settings: BackchannelSettings,
        conversation: Arc<ConversationManager>,
        bus: Arc<EventBus>,
        seed: u64,
    ) -> Self {
        Self {
            settings,
            conversation,
            bus,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Evaluate one SILENCE_DETECTED heartbeat. Returns whether a
    /// backchannel was triggered.
    pub fn on_silence(&self, silence_duration_ms: u64, ts_ms: u64) -> bool {
        if !self.gates_pass(silence_duration_ms, ts_ms) {
            return false;
        }

        let probability = self.probability(ts_ms);
        let draw: f64 = self.rng.lock().expect("rng mutex poisoned").gen();
        if draw >= probability {
            return false;
        }

        tracing::debug!(probability, silence_duration_ms, "backchannel_triggered");
        self.bus.emit(Event::BackchannelTriggered {
            ts_ms,
            trigger_strength: probability as f32,
            silence_duration_ms,
            backchannel: None,
            proceed_to_play: false,
        });
        true
    }

    /// All hard gates must pass before probability even gets computed.
    pub fn gates_pass(&self, silence_duration_ms: u64, now_ms: u64) -> bool {
        if self.conversation.state() != ConversationState::UserSpeaking {
            return false;
        }

        if !(TRIGGER_MIN_SILENCE_MS..=TRIGGER_MAX_SILENCE_MS).contains(&silence_duration_ms) {
            return false;
        }

        let snapshot = self.conversation.snapshot();
        if snapshot
            .since_last_backchannel_ms(now_ms)
            .is_some_and(|ms| ms < self.settings.min_interval_ms())
        {
            return false;
        }

        if snapshot.sentence_count_current_turn < 2 {
            return false;
        }

        let transcript = self.conversation.current_turn_transcript();
        transcript.split_whitespace().count() >= 5
    }

    /// Base probability shaped by conversational context, clamped to [0, 1].
    pub fn probability(&self, now_ms: u64) -> f64 {
        let mut probability = self.settings.base_probability;

        let snapshot = self.conversation.snapshot();
        let transcript = self.conversation.current_turn_transcript().to_lowercase();

        if self.contains_emotion_keyword(&transcript) {
            probability += 0.3;
        }
        if self.contains_explicit_prompt(&transcript) {
            probability += 0.5;
        }
        if snapshot
            .since_last_backchannel_ms(now_ms)
            .is_some_and(|ms| ms < RECENT_BACKCHANNEL_MS)
        {
            probability -= 0.2;
        }
        if snapshot.speaking_duration_ms(now_ms) < MIN_SPEAKING_MS {
            probability -= 0.3;
        }
        if transcript
            .trim_end()
            .ends_with(['.', '!', '?'])
        {
            probability += 0.2;
        }

        probability.clamp(0.0, 1.0)
    }

    fn contains_emotion_keyword(&self, transcript: &str) -> bool {
        let words: std::collections::HashSet<&str> = transcript
            .split_whitespace()
            .map(|w| w.trim_end_matches(['.', ',', '!', '?', ';', ':']))
            .collect();
        self.settings
            .emotion_keywords
            .iter()
            .any(|keyword| words.contains(keyword.as_str()))
    }

    fn contains_explicit_prompt(&self, transcript: &str) -> bool {
        self.settings
            .explicit_prompts
            .iter()
            .any(|prompt| transcript.contains(prompt.as_str()))
    }
}
