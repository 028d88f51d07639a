//! Response generation: LLM completion streamed into text, synthesized to
//! one clip, and played on the mixer's primary channel.
//!
//! Once TURN_ENDED fires this runs to completion; there is no path back to
//! USER_SPEAKING if the user resumes mid-generation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parley_audio::{convert, AudioMixer, SAMPLE_RATE};
use parley_conversation::{ConversationManager, Speaker};
use parley_events::{ConversationState, Event, EventBus};

use crate::clients::{retry_with_backoff, ChatMessage, LanguageModel, Role, TextToSpeech};
use crate::config::ResponseSettings;

pub struct ResponseCoordinator {
    settings: ResponseSettings,
    conversation: Arc<ConversationManager>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    mixer: Arc<AudioMixer>,
    bus: Arc<EventBus>,
}

impl ResponseCoordinator {
    pub fn new(
        settings: ResponseSettings,
        conversation: Arc<ConversationManager>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        mixer: Arc<AudioMixer>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            conversation,
            llm,
            tts,
            mixer,
            bus,
        }
    }

    /// Handle one TURN_ENDED event end to end: think, speak, go idle.
    pub async fn on_turn_ended(&self, transcript: String, ts_ms: u64) {
        if transcript.trim().is_empty() {
            tracing::warn!("turn ended with empty transcript, ignoring");
            return;
        }

        // Usually a no-op: the turn detector already moved the state.
        self.conversation
            .update_state(ConversationState::AgentThinking, ts_ms);

        self.bus.emit(Event::ResponseGenerating {
            ts_ms,
            user_utterance: transcript.clone(),
        });

        let response_text = self.generate(&transcript, ts_ms).await;
        if response_text.trim().is_empty() {
            tracing::warn!("language model produced no text, returning to idle");
            self.conversation.update_state(ConversationState::Idle, ts_ms);
            return;
        }

        let Some(samples) = self.synthesize(&response_text).await else {
            // The turn still ends; it just ends silently.
            tracing::warn!("speech synthesis failed, ending turn without audio");
            self.conversation.update_state(ConversationState::Idle, ts_ms);
            return;
        };

        let audio_duration_ms = samples.len() as u64 * 1000 / SAMPLE_RATE as u64;
        self.conversation
            .update_state(ConversationState::AgentSpeaking, ts_ms);
        self.bus.emit(Event::ResponseStarted {
            ts_ms,
            text: response_text.clone(),
            audio_duration_ms,
        });

        self.mixer.push_primary(&samples);

        // Hold the floor for the clip's real-time length.
        tokio::time::sleep(Duration::from_millis(audio_duration_ms)).await;

        self.bus.emit(Event::ResponseEnded {
            ts_ms,
            text: response_text.clone(),
        });

        self.conversation
            .add_transcript(&response_text, true, Speaker::Agent, ts_ms);
        self.conversation.reset_turn();
        self.conversation.update_state(ConversationState::Idle, ts_ms);
    }

    /// Stream the completion into a buffer, emitting per-chunk events.
    /// Outright failure after retries yields the stock apology.
    async fn generate(&self, user_utterance: &str, ts_ms: u64) -> String {
        let messages = self.build_messages(user_utterance);

        let stream = retry_with_backoff(
            self.settings.max_attempts,
            Duration::from_millis(self.settings.retry_base_delay_ms),
            || self.llm.complete(messages.clone()),
        )
        .await;

        let mut stream = match stream {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(%error, "completion failed after retries");
                return self.settings.apology.clone();
            }
        };

        let mut response = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    self.bus.emit(Event::ResponseChunk {
                        ts_ms,
                        chunk: chunk.clone(),
                    });
                    response.push_str(&chunk);
                }
                Err(error) => {
                    tracing::warn!(%error, "token stream broke mid-response");
                    break;
                }
            }
        }

        response
    }

    async fn synthesize(&self, text: &str) -> Option<Vec<f32>> {
        let pcm = retry_with_backoff(
            self.settings.max_attempts,
            Duration::from_millis(self.settings.retry_base_delay_ms),
            || self.tts.synthesize(text),
        )
        .await
        .ok()??;

        let samples = convert::pcm16_bytes_to_f32(&pcm);
        Some(convert::resample_clip(
            &samples,
            self.tts.sample_rate(),
            SAMPLE_RATE,
        ))
    }

    /// {system, …(user,assistant)*, user} from the tail of the log.
    fn build_messages(&self, user_utterance: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::new(
            Role::System,
            self.settings.system_prompt.clone(),
        )];

        let history = self.conversation.full_conversation();
        let lines: Vec<&str> = history.lines().collect();
        let skip = lines.len().saturating_sub(self.settings.history_lines);
        for line in &lines[skip..] {
            if let Some(text) = line.strip_prefix("User: ") {
                messages.push(ChatMessage::new(Role::User, text.trim()));
            } else if let Some(text) = line.strip_prefix("Agent: ") {
                messages.push(ChatMessage::new(Role::Assistant, text.trim()));
            }
        }

        messages.push(ChatMessage::new(Role::User, user_utterance));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientError, ClientResult, ScriptedLlm, StaticTts};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use parley_events::EventKind;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct FailingLlm;

    #[async_trait]
    impl LanguageModel for FailingLlm {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
        ) -> ClientResult<BoxStream<'static, ClientResult<String>>> {
            Err(ClientError::Transport("unreachable".into()))
        }
    }

    struct FailingTts;

    #[async_trait]
    impl TextToSpeech for FailingTts {
        async fn synthesize(&self, _text: &str) -> ClientResult<Option<Vec<u8>>> {
            Err(ClientError::Backend("synth down".into()))
        }
    }

    fn fast_settings() -> ResponseSettings {
        ResponseSettings {
            retry_base_delay_ms: 10,
            ..ResponseSettings::default()
        }
    }

    fn setup(
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> (
        ResponseCoordinator,
        Arc<ConversationManager>,
        Arc<AudioMixer>,
        UnboundedReceiver<Event>,
    ) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe(&[
            EventKind::ResponseGenerating,
            EventKind::ResponseChunk,
            EventKind::ResponseStarted,
            EventKind::ResponseEnded,
        ]);
        let conversation = Arc::new(ConversationManager::new(bus.clone()));
        let mixer = Arc::new(AudioMixer::new(0.5));
        let coordinator = ResponseCoordinator::new(
            fast_settings(),
            conversation.clone(),
            llm,
            tts,
            mixer.clone(),
            bus,
        );
        (coordinator, conversation, mixer, rx)
    }

    /// Walk the conversation into the state a real turn end leaves behind.
    fn arrive_at_thinking(conversation: &ConversationManager) {
        conversation.update_state(ConversationState::UserSpeaking, 0);
        conversation.start_user_speech(0);
        conversation.update_state(ConversationState::AgentThinking, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_speaks_and_returns_to_idle() {
        let (coordinator, conversation, mixer, mut rx) = setup(
            Arc::new(ScriptedLlm::new("It is half past three.")),
            Arc::new(StaticTts::with_tone()),
        );
        conversation.add_transcript("What time is it?", true, Speaker::User, 900);
        arrive_at_thinking(&conversation);

        coordinator
            .on_turn_ended("What time is it?".to_string(), 1000)
            .await;

        assert_eq!(conversation.state(), ConversationState::Idle);

        // Agent speech landed on the primary channel.
        assert!(mixer.pending().0 > 0);

        // The reply joined the log and the turn counters were reset.
        let history = conversation.full_conversation();
        assert!(history.ends_with("Agent: It is half past three."));
        assert_eq!(conversation.snapshot().word_count_current_turn, 0);

        let events: Vec<Event> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(events.first(), Some(Event::ResponseGenerating { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ResponseChunk { .. })));
        let started = events.iter().find_map(|e| match e {
            Event::ResponseStarted {
                audio_duration_ms, ..
            } => Some(*audio_duration_ms),
            _ => None,
        });
        // 12k samples at 24 kHz resampled to 16 kHz is about half a second.
        let started = started.expect("response started event");
        assert!((400..=600).contains(&started));
        assert!(matches!(events.last(), Some(Event::ResponseEnded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_completion_short_circuits_to_idle() {
        let (coordinator, conversation, mixer, mut rx) = setup(
            Arc::new(ScriptedLlm::new("")),
            Arc::new(StaticTts::with_tone()),
        );
        arrive_at_thinking(&conversation);

        coordinator.on_turn_ended("Say nothing.".to_string(), 1000).await;

        assert_eq!(conversation.state(), ConversationState::Idle);
        assert_eq!(mixer.pending(), (0, 0));

        let events: Vec<Event> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events
            .iter()
            .all(|e| !matches!(e, Event::ResponseStarted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_failure_speaks_the_apology() {
        let (coordinator, conversation, mixer, _rx) =
            setup(Arc::new(FailingLlm), Arc::new(StaticTts::with_tone()));
        arrive_at_thinking(&conversation);

        coordinator.on_turn_ended("Hello?".to_string(), 1000).await;

        assert_eq!(conversation.state(), ConversationState::Idle);
        // The apology still gets synthesized and spoken.
        assert!(mixer.pending().0 > 0);
        assert!(conversation
            .full_conversation()
            .contains("I'm sorry, I encountered an error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tts_failure_ends_turn_silently() {
        let (coordinator, conversation, mixer, _rx) = setup(
            Arc::new(ScriptedLlm::new("You will never hear this.")),
            Arc::new(FailingTts),
        );
        arrive_at_thinking(&conversation);

        coordinator.on_turn_ended("Hello?".to_string(), 1000).await;

        assert_eq!(conversation.state(), ConversationState::Idle);
        assert_eq!(mixer.pending(), (0, 0));
        // Nothing was spoken, so nothing joined the log.
        assert!(!conversation.full_conversation().contains("never hear"));
    }

    struct BrokenStreamLlm;

    #[async_trait]
    impl LanguageModel for BrokenStreamLlm {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
        ) -> ClientResult<BoxStream<'static, ClientResult<String>>> {
            use futures::StreamExt;
            let stream = async_stream::stream! {
                yield Ok("Partial ".to_string());
                yield Ok("reply.".to_string());
                yield Err(ClientError::Transport("stream reset".into()));
                yield Ok("lost tail".to_string());
            };
            Ok(stream.boxed())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_stream_keeps_partial_reply() {
        let (coordinator, conversation, mixer, _rx) =
            setup(Arc::new(BrokenStreamLlm), Arc::new(StaticTts::with_tone()));
        arrive_at_thinking(&conversation);

        coordinator.on_turn_ended("Hello?".to_string(), 1000).await;

        // Whatever arrived before the break still gets spoken; the tail
        // after the error is dropped.
        assert_eq!(conversation.state(), ConversationState::Idle);
        assert!(mixer.pending().0 > 0);
        let history = conversation.full_conversation();
        assert!(history.contains("Agent: Partial reply."));
        assert!(!history.contains("lost tail"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_transcript_is_ignored() {
        let (coordinator, conversation, _mixer, mut rx) = setup(
            Arc::new(ScriptedLlm::new("unused")),
            Arc::new(StaticTts::with_tone()),
        );
        arrive_at_thinking(&conversation);

        coordinator.on_turn_ended("   ".to_string(), 1000).await;

        // Untouched: still thinking, no events.
        assert_eq!(conversation.state(), ConversationState::AgentThinking);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_sequence_shape() {
        let (coordinator, conversation, _mixer, _rx) = setup(
            Arc::new(ScriptedLlm::new("ok")),
            Arc::new(StaticTts::with_tone()),
        );
        conversation.add_transcript("First question", true, Speaker::User, 100);
        conversation.add_transcript("First answer", true, Speaker::Agent, 900);

        let messages = coordinator.build_messages("Second question");
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, "First question");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[3].role, Role::User);
        assert_eq!(messages[3].content, "Second question");
    }
}
