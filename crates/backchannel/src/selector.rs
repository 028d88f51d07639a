//! Context-aware backchannel selection with anti-repetition.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use parley_conversation::ConversationManager;
use parley_events::{BackchannelKind, Event, EventBus};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{rngs::StdRng, SeedableRng};

use crate::BackchannelSettings;

/// How many recent picks the anti-repetition window remembers.
const RECENT_WINDOW: usize = 3;

/// Openers that mark the user's clause as a question for candidate choice.
const QUESTION_OPENERS: [&str; 6] = ["what", "when", "where", "who", "why", "how"];

pub struct BackchannelSelector {
    settings: BackchannelSettings,
    conversation: Arc<ConversationManager>,
    bus: Arc<EventBus>,
    state: Mutex<SelectorState>,
}

struct SelectorState {
    recent: VecDeque<BackchannelKind>,
    usage: HashMap<BackchannelKind, u32>,
    rng: StdRng,
}

impl BackchannelSelector {
    pub fn new(
        settings: BackchannelSettings,
        conversation: Arc<ConversationManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self::with_rng(settings, conversation, bus, StdRng::from_entropy())
    }

    pub fn with_seed(
        settings: BackchannelSettings,
        conversation: Arc<ConversationManager>,
        bus: Arc<EventBus>,
        seed: u64,
    ) -> Self {
        Self::with_rng(settings, conversation, bus, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        settings: BackchannelSettings,
        conversation: Arc<ConversationManager>,
        bus: Arc<EventBus>,
        rng: StdRng,
    ) -> Self {
        Self {
            settings,
            conversation,
            bus,
            state: Mutex::new(SelectorState {
                recent: VecDeque::with_capacity(RECENT_WINDOW),
                usage: HashMap::new(),
                rng,
            }),
        }
    }

    /// Handle a first-stage BACKCHANNEL_TRIGGERED: pick a kind and re-emit
    /// the event enriched with it.
    pub fn on_triggered(
        &self,
        trigger_strength: f32,
        silence_duration_ms: u64,
        ts_ms: u64,
    ) -> BackchannelKind {
        let transcript = self.conversation.current_turn_transcript();
        let selected = self.select(&transcript);

        tracing::debug!(kind = %selected, "backchannel_selected");
        self.bus.emit(Event::BackchannelTriggered {
            ts_ms,
            trigger_strength,
            silence_duration_ms,
            backchannel: Some(selected),
            proceed_to_play: false,
        });
        selected
    }

    /// Pick a kind for the given transcript and record its usage.
    pub fn select(&self, transcript: &str) -> BackchannelKind {
        let mut candidates = self.candidates(transcript);
        let mut state = self.state.lock().expect("selector mutex poisoned");

        apply_anti_repetition(&mut candidates, &state.recent);
        if candidates.is_empty() {
            candidates = BackchannelKind::ALL.to_vec();
        }

        // Prefer the least-worn clips.
        let weights: Vec<f64> = candidates
            .iter()
            .map(|kind| 1.0 / (*state.usage.get(kind).unwrap_or(&0) as f64 + 1.0))
            .collect();
        let dist = WeightedIndex::new(&weights).expect("candidate weights are positive");
        let selected = candidates[dist.sample(&mut state.rng)];

        if state.recent.len() == RECENT_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(selected);
        *state.usage.entry(selected).or_insert(0) += 1;

        selected
    }

    /// Candidate sets by conversational register.
    pub fn candidates(&self, transcript: &str) -> Vec<BackchannelKind> {
        let lower = transcript.to_lowercase();

        let is_question = transcript.trim_end().ends_with('?')
            || QUESTION_OPENERS.iter().any(|q| lower.starts_with(q));
        if is_question {
            return vec![BackchannelKind::Right, BackchannelKind::ISee];
        }

        if self
            .settings
            .emotion_keywords
            .iter()
            .any(|keyword| lower.contains(keyword.as_str()))
        {
            return vec![BackchannelKind::Yeah, BackchannelKind::Right];
        }

        vec![
            BackchannelKind::Mmhmm,
            BackchannelKind::Okay,
            BackchannelKind::ISee,
        ]
    }
}

/// Drop the most recently used kind; if the last two picks were the same
/// kind, drop it as well (it is already gone after the first rule, but the
/// window may have rotated).
fn apply_anti_repetition(candidates: &mut Vec<BackchannelKind>, recent: &VecDeque<BackchannelKind>) {
    if let Some(&last) = recent.back() {
        candidates.retain(|k| *k != last);
    }
    if recent.len() >= 2 {
        let last = recent[recent.len() - 1];
        if last == recent[recent.len() - 2] {
            candidates.retain(|k| *k != last);
        }
    }
}
