//! Backchannel playback: commit the clip to the mixer's secondary channel.

use std::sync::Arc;

use parley_audio::{AudioMixer, SAMPLE_RATE};
use parley_conversation::ConversationManager;
use parley_events::{BackchannelKind, Event, EventBus};

use crate::BackchannelLibrary;

pub struct BackchannelPlayer {
    library: Arc<BackchannelLibrary>,
    mixer: Arc<AudioMixer>,
    conversation: Arc<ConversationManager>,
    bus: Arc<EventBus>,
}

impl BackchannelPlayer {
    pub fn new(
        library: Arc<BackchannelLibrary>,
        mixer: Arc<AudioMixer>,
        conversation: Arc<ConversationManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            library,
            mixer,
            conversation,
            bus,
        }
    }

    /// Handle a proceed-to-play trigger: queue the clip, record the event,
    /// announce it. Conversation state is deliberately untouched: the user
    /// still holds the floor.
    ///
    /// The record lands only after the audio is committed to the mixer.
    pub fn on_proceed(&self, kind: BackchannelKind, ts_ms: u64) {
        let Some(clip) = self.library.clip(kind) else {
            tracing::warn!(kind = %kind, "backchannel clip missing from library");
            return;
        };

        self.mixer.push_secondary(&clip);
        self.conversation.record_backchannel(kind, true, ts_ms);

        let duration_ms = clip.len() as u64 * 1000 / SAMPLE_RATE as u64;
        tracing::debug!(kind = %kind, duration_ms, "backchannel_played");
        self.bus.emit(Event::BackchannelPlayed {
            ts_ms,
            backchannel: kind,
            duration_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_events::{ConversationState, EventKind};

    fn setup() -> (
        BackchannelPlayer,
        Arc<ConversationManager>,
        Arc<AudioMixer>,
        tokio::sync::mpsc::UnboundedReceiver<Event>,
    ) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe(&[EventKind::BackchannelPlayed]);
        let conversation = Arc::new(ConversationManager::new(bus.clone()));
        let mixer = Arc::new(AudioMixer::new(0.5));
        let library = Arc::new(BackchannelLibrary::from_clips([(
            BackchannelKind::Yeah,
            vec![0.4f32; 1600],
        )]));
        let player = BackchannelPlayer::new(library, mixer.clone(), conversation.clone(), bus);
        (player, conversation, mixer, rx)
    }

    #[test]
    fn test_playback_commits_audio_then_records() {
        let (player, conversation, mixer, mut rx) = setup();
        conversation.update_state(ConversationState::UserSpeaking, 0);

        player.on_proceed(BackchannelKind::Yeah, 7000);

        // Clip queued on the secondary channel at the mixer's gain.
        assert_eq!(mixer.pending(), (0, 1600));
        let out = mixer.take_receiver().unwrap();
        mixer.mix_ready();
        let block = out.try_recv().unwrap();
        assert!((block[0] - 0.2).abs() < 1e-6);

        let snapshot = conversation.snapshot();
        assert_eq!(snapshot.last_backchannel_ms, Some(7000));
        assert_eq!(snapshot.backchannel_count, 1);

        match rx.try_recv().unwrap() {
            Event::BackchannelPlayed {
                backchannel,
                duration_ms,
                ..
            } => {
                assert_eq!(backchannel, BackchannelKind::Yeah);
                assert_eq!(duration_ms, 100);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The user is still speaking; playback never touches state.
        assert_eq!(conversation.state(), ConversationState::UserSpeaking);
    }

    #[test]
    fn test_missing_clip_is_a_noop() {
        let (player, conversation, mixer, mut rx) = setup();

        player.on_proceed(BackchannelKind::Okay, 7000);

        assert_eq!(mixer.pending(), (0, 0));
        assert_eq!(conversation.snapshot().backchannel_count, 0);
        assert!(rx.try_recv().is_err());
    }
}
