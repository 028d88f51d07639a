//! Conversation state: the single source of truth.
//!
//! The [`ConversationManager`] is the only writer of conversation state,
//! the transcript log, and backchannel history. Every other component holds
//! read-only views. Mutators are serialized by an internal lock; readers
//! observe either the pre- or post-mutation snapshot, never a torn one.
//!
//! Timing bookkeeping uses caller-supplied stream-clock milliseconds (the
//! audio pipeline's clock), keeping the whole machine deterministic.

use std::sync::{Arc, Mutex};

pub use parley_events::{BackchannelKind, ConversationState, Speaker};

use parley_events::{Event, EventBus};
use serde::Serialize;
use uuid::Uuid;

/// One committed span of transcribed speech.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptSegment {
    pub id: Uuid,
    pub text: String,
    pub ts_ms: u64,
    pub is_final: bool,
    pub speaker: Speaker,
}

/// One played (or attempted) backchannel.
///
/// `was_successful` is a placeholder: nothing measures yet whether the user
/// actually kept the floor afterwards, so players record `true`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BackchannelRecord {
    pub kind: BackchannelKind,
    pub ts_ms: u64,
    pub was_successful: bool,
}

#[derive(Debug)]
struct ConversationContext {
    state: ConversationState,
    /// Stream-clock start of the current user speech run.
    speech_start_ms: Option<u64>,
    /// Non-null exactly while the VAD sits in post-speech silence.
    silence_start_ms: Option<u64>,
    silence_duration_ms: u64,
    partial_transcript: String,
    segments: Vec<TranscriptSegment>,
    backchannels: Vec<BackchannelRecord>,
    word_count_current_turn: u32,
    sentence_count_current_turn: u32,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self {
            state: ConversationState::Idle,
            speech_start_ms: None,
            silence_start_ms: None,
            silence_duration_ms: 0,
            partial_transcript: String::new(),
            segments: Vec::new(),
            backchannels: Vec::new(),
            word_count_current_turn: 0,
            sentence_count_current_turn: 0,
        }
    }
}

/// Read-only view of the turn-local bookkeeping.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Snapshot {
    pub state: ConversationState,
    pub speech_start_ms: Option<u64>,
    pub silence_start_ms: Option<u64>,
    pub silence_duration_ms: u64,
    pub word_count_current_turn: u32,
    pub sentence_count_current_turn: u32,
    pub last_backchannel_ms: Option<u64>,
    pub segment_count: usize,
    pub backchannel_count: usize,
}

impl Snapshot {
    /// Duration of the current user speech run at `now_ms`.
    pub fn speaking_duration_ms(&self, now_ms: u64) -> u64 {
        self.speech_start_ms
            .map_or(0, |start| now_ms.saturating_sub(start))
    }

    /// Milliseconds since the last backchannel, or None if none played yet.
    pub fn since_last_backchannel_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_backchannel_ms
            .map(|last| now_ms.saturating_sub(last))
    }
}

pub struct ConversationManager {
    inner: Mutex<ConversationContext>,
    bus: Arc<EventBus>,
}

impl ConversationManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(ConversationContext::default()),
            bus,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.lock().state
    }

    pub fn snapshot(&self) -> Snapshot {
        let ctx = self.lock();
        Snapshot {
            state: ctx.state,
            speech_start_ms: ctx.speech_start_ms,
            silence_start_ms: ctx.silence_start_ms,
            silence_duration_ms: ctx.silence_duration_ms,
            word_count_current_turn: ctx.word_count_current_turn,
            sentence_count_current_turn: ctx.sentence_count_current_turn,
            last_backchannel_ms: ctx.backchannels.last().map(|b| b.ts_ms),
            segment_count: ctx.segments.len(),
            backchannel_count: ctx.backchannels.len(),
        }
    }

    /// Transition the conversation state, emitting STATE_CHANGED.
    ///
    /// A same-state update is a silent no-op (no spurious events); an
    /// illegal transition is refused and logged. Returns whether the
    /// transition happened.
    pub fn update_state(&self, new: ConversationState, ts_ms: u64) -> bool {
        let old = {
            let mut ctx = self.lock();
            let old = ctx.state;
            if old == new {
                return false;
            }
            if !old.can_transition_to(new) {
                tracing::warn!(?old, ?new, "refusing illegal state transition");
                return false;
            }
            ctx.state = new;
            old
        };
        self.bus.emit(Event::StateChanged { ts_ms, old, new });
        true
    }

    /// Append a transcript segment. Final segments are appended to the log
    /// (and, for the user, bump the turn counters); partial segments just
    /// overwrite the rolling partial text.
    pub fn add_transcript(&self, text: &str, is_final: bool, speaker: Speaker, ts_ms: u64) {
        let mut ctx = self.lock();

        if !is_final {
            ctx.partial_transcript = text.to_string();
            return;
        }

        ctx.segments.push(TranscriptSegment {
            id: Uuid::new_v4(),
            text: text.to_string(),
            ts_ms,
            is_final,
            speaker,
        });

        if speaker == Speaker::User {
            ctx.partial_transcript.clear();
            ctx.word_count_current_turn += text.split_whitespace().count() as u32;
            let sentences = text.chars().filter(|c| ['.', '?', '!'].contains(c)).count() as u32;
            ctx.sentence_count_current_turn += sentences.max(1);
        }
    }

    /// Record a played backchannel. Called only after the playback stage
    /// commits audio to the mixer.
    pub fn record_backchannel(&self, kind: BackchannelKind, was_successful: bool, ts_ms: u64) {
        let mut ctx = self.lock();
        ctx.backchannels.push(BackchannelRecord {
            kind,
            ts_ms,
            was_successful,
        });
    }

    pub fn start_user_speech(&self, ts_ms: u64) {
        let mut ctx = self.lock();
        ctx.speech_start_ms = Some(ts_ms);
        ctx.silence_start_ms = None;
        ctx.silence_duration_ms = 0;
    }

    pub fn start_silence(&self, ts_ms: u64) {
        let mut ctx = self.lock();
        ctx.silence_start_ms = Some(ts_ms);
    }

    pub fn update_silence_duration(&self, duration_ms: u64) {
        let mut ctx = self.lock();
        ctx.silence_duration_ms = duration_ms;
    }

    /// Clear turn-local counters after the agent's reply (or an abandoned
    /// turn). The transcript log and backchannel history persist.
    pub fn reset_turn(&self) {
        let mut ctx = self.lock();
        ctx.speech_start_ms = None;
        ctx.silence_start_ms = None;
        ctx.silence_duration_ms = 0;
        ctx.partial_transcript.clear();
        ctx.word_count_current_turn = 0;
        ctx.sentence_count_current_turn = 0;
    }

    /// All final user text since the last agent segment, oldest first.
    pub fn current_turn_transcript(&self) -> String {
        let ctx = self.lock();
        let mut parts: Vec<&str> = Vec::new();
        for segment in ctx.segments.iter().rev() {
            match segment.speaker {
                Speaker::Agent => break,
                Speaker::User if segment.is_final => parts.push(&segment.text),
                Speaker::User => {}
            }
        }
        parts.reverse();
        parts.join(" ")
    }

    /// The whole conversation formatted for the language model.
    pub fn full_conversation(&self) -> String {
        let ctx = self.lock();
        ctx.segments
            .iter()
            .filter(|s| s.is_final)
            .map(|s| match s.speaker {
                Speaker::User => format!("User: {}", s.text),
                Speaker::Agent => format!("Agent: {}", s.text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn recent_segments(&self, n: usize) -> Vec<TranscriptSegment> {
        let ctx = self.lock();
        let skip = ctx.segments.len().saturating_sub(n);
        ctx.segments[skip..].to_vec()
    }

    pub fn partial_transcript(&self) -> String {
        self.lock().partial_transcript.clone()
    }

    pub fn backchannel_history(&self) -> Vec<BackchannelRecord> {
        self.lock().backchannels.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConversationContext> {
        self.inner.lock().expect("conversation mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_events::EventKind;

    fn manager() -> (ConversationManager, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe(&[EventKind::StateChanged]);
        (ConversationManager::new(bus), rx)
    }

    #[test]
    fn test_legal_transition_emits_state_changed() {
        let (manager, mut rx) = manager();
        assert!(manager.update_state(ConversationState::UserSpeaking, 100));
        assert_eq!(manager.state(), ConversationState::UserSpeaking);

        match rx.try_recv().unwrap() {
            Event::StateChanged { old, new, ts_ms } => {
                assert_eq!(old, ConversationState::Idle);
                assert_eq!(new, ConversationState::UserSpeaking);
                assert_eq!(ts_ms, 100);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_same_state_update_is_silent_noop() {
        let (manager, mut rx) = manager();
        manager.update_state(ConversationState::UserSpeaking, 0);
        let _ = rx.try_recv();

        assert!(!manager.update_state(ConversationState::UserSpeaking, 50));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_illegal_transition_is_refused() {
        let (manager, mut rx) = manager();
        // Idle cannot jump straight to the agent thinking.
        assert!(!manager.update_state(ConversationState::AgentThinking, 0));
        assert_eq!(manager.state(), ConversationState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_final_user_segments_bump_turn_counters() {
        let (manager, _rx) = manager();
        manager.add_transcript("I went to the store.", true, Speaker::User, 1000);
        manager.add_transcript("It was closed. Typical!", true, Speaker::User, 2500);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.word_count_current_turn, 9);
        assert_eq!(snapshot.sentence_count_current_turn, 3);
        assert_eq!(snapshot.segment_count, 2);
    }

    #[test]
    fn test_partial_segments_overwrite_not_append() {
        let (manager, _rx) = manager();
        manager.add_transcript("I went", false, Speaker::User, 500);
        manager.add_transcript("I went to", false, Speaker::User, 800);

        assert_eq!(manager.partial_transcript(), "I went to");
        assert_eq!(manager.snapshot().segment_count, 0);
        assert_eq!(manager.snapshot().word_count_current_turn, 0);

        manager.add_transcript("I went to the store", true, Speaker::User, 1000);
        assert_eq!(manager.partial_transcript(), "");
        assert_eq!(manager.snapshot().segment_count, 1);
    }

    #[test]
    fn test_current_turn_transcript_stops_at_agent_segment() {
        let (manager, _rx) = manager();
        manager.add_transcript("Hello there", true, Speaker::User, 100);
        manager.add_transcript("Hi! How can I help?", true, Speaker::Agent, 2000);
        manager.add_transcript("I need to book", true, Speaker::User, 4000);
        manager.add_transcript("a flight for tomorrow", true, Speaker::User, 5000);

        assert_eq!(
            manager.current_turn_transcript(),
            "I need to book a flight for tomorrow"
        );
    }

    #[test]
    fn test_full_conversation_formatting() {
        let (manager, _rx) = manager();
        manager.add_transcript("Hello", true, Speaker::User, 100);
        manager.add_transcript("Hi there", true, Speaker::Agent, 900);

        assert_eq!(manager.full_conversation(), "User: Hello\nAgent: Hi there");
    }

    #[test]
    fn test_backchannel_record_updates_last_time() {
        let (manager, _rx) = manager();
        assert!(manager.snapshot().last_backchannel_ms.is_none());

        manager.record_backchannel(BackchannelKind::Yeah, true, 7000);
        manager.record_backchannel(BackchannelKind::Mmhmm, true, 13_000);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.last_backchannel_ms, Some(13_000));
        assert_eq!(snapshot.backchannel_count, 2);
        assert_eq!(snapshot.since_last_backchannel_ms(18_000), Some(5000));
    }

    #[test]
    fn test_reset_turn_clears_counters_only() {
        let (manager, _rx) = manager();
        manager.start_user_speech(1000);
        manager.start_silence(4000);
        manager.update_silence_duration(500);
        manager.add_transcript("Some words here.", true, Speaker::User, 4000);
        manager.record_backchannel(BackchannelKind::Okay, true, 3000);

        manager.reset_turn();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, ConversationState::Idle);
        assert_eq!(snapshot.word_count_current_turn, 0);
        assert_eq!(snapshot.sentence_count_current_turn, 0);
        assert!(snapshot.speech_start_ms.is_none());
        assert!(snapshot.silence_start_ms.is_none());
        assert_eq!(snapshot.silence_duration_ms, 0);
        // History survives the turn boundary.
        assert_eq!(snapshot.segment_count, 1);
        assert_eq!(snapshot.backchannel_count, 1);
    }

    #[test]
    fn test_speaking_duration_from_stream_clock() {
        let (manager, _rx) = manager();
        manager.start_user_speech(2000);
        assert_eq!(manager.snapshot().speaking_duration_ms(9500), 7500);
        // Resumption resets silence bookkeeping.
        manager.start_silence(9500);
        assert!(manager.snapshot().silence_start_ms.is_some());
        manager.start_user_speech(10_000);
        assert!(manager.snapshot().silence_start_ms.is_none());
    }
}
