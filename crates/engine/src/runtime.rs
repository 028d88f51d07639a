//! The engine runtime: constructs every component, wires them over the
//! event bus, and owns the worker loops.
//!
//! One ingest task owns the audio pipeline and the VAD machine, so chunk
//! draining, probability inference, and STT dispatch stay totally ordered
//! per connection. Everything else reacts to bus subscriptions on its own
//! task. Shutdown cancels the lot and clears the buffers.

use std::sync::Arc;

use parley_audio::{AudioMixer, AudioPipeline};
use parley_backchannel::{
    BackchannelLibrary, BackchannelPlayer, BackchannelSelector, TimingController, TriggerDetector,
};
use parley_conversation::ConversationManager;
use parley_events::{ConversationState, Event, EventBus, EventKind};
use parley_turn::TurnDetector;
use parley_vad::{SpeechOracle, VadProcessor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clients::{LanguageModel, SpeechToText, TextToSpeech};
use crate::config::{ConfigError, EngineConfig};
use crate::response::ResponseCoordinator;
use crate::transcription::TranscriptionCoordinator;

/// Mixer cadence.
const TICK_MS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The external network collaborators, behind their capability traits.
pub struct Collaborators {
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub llm: Arc<dyn LanguageModel>,
}

enum IngestFrame {
    F32 {
        samples: Vec<f32>,
        channels: usize,
        sample_rate: u32,
    },
    Pcm16 {
        samples: Vec<i16>,
        channels: usize,
        sample_rate: u32,
    },
}

pub struct Engine {
    bus: Arc<EventBus>,
    conversation: Arc<ConversationManager>,
    mixer: Arc<AudioMixer>,
    ingest_tx: mpsc::UnboundedSender<IngestFrame>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Validate the config and bring every worker up. Must be called
    /// inside a tokio runtime.
    pub fn start(
        config: EngineConfig,
        oracle: Box<dyn SpeechOracle>,
        library: BackchannelLibrary,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let conversation = Arc::new(ConversationManager::new(bus.clone()));
        let mixer = Arc::new(AudioMixer::new(config.backchannel.volume));
        let library = Arc::new(library);

        if let Err(error) = library.validate() {
            tracing::warn!(%error, "backchannel library incomplete, some kinds will not play");
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // Mixer tick: drain both channels into the transport stream.
        {
            let mixer = mixer.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(TICK_MS)) => {
                            mixer.mix_ready();
                        }
                    }
                }
            }));
        }

        // Ingest: frames in, VAD chunks through the oracle, transcriber
        // windows out to the STT collaborator.
        let (ingest_tx, mut ingest_rx) = mpsc::unbounded_channel::<IngestFrame>();
        {
            let transcription = TranscriptionCoordinator::new(
                collaborators.stt.clone(),
                conversation.clone(),
                bus.clone(),
                &config.response,
            );
            let mut pipeline = AudioPipeline::new(config.audio.clone(), bus.clone());
            let mut vad = VadProcessor::new(config.vad, oracle, bus.clone());
            let cancel = cancel.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            pipeline.clear();
                            vad.reset();
                            break;
                        }
                        frame = ingest_rx.recv() => {
                            let Some(frame) = frame else { break };
                            let received = match frame {
                                IngestFrame::F32 { samples, channels, sample_rate } => {
                                    pipeline.receive_frame(&samples, channels, sample_rate)
                                }
                                IngestFrame::Pcm16 { samples, channels, sample_rate } => {
                                    pipeline.receive_pcm16(&samples, channels, sample_rate)
                                }
                            };
                            if let Err(error) = received {
                                tracing::warn!(%error, "dropping malformed frame");
                                continue;
                            }

                            let chunks: Vec<Vec<f32>> = pipeline.drain_vad_chunks().collect();
                            for chunk in chunks {
                                vad.process_chunk(&chunk);
                            }

                            let ts_ms = pipeline.stream_clock_ms();
                            let windows: Vec<Vec<f32>> =
                                pipeline.drain_transcriber_chunks().collect();
                            for window in windows {
                                transcription.dispatch(window, ts_ms);
                            }
                        }
                    }
                }
            }));
        }

        // State listener: VAD edges drive the conversation state machine
        // and its timing bookkeeping.
        {
            let mut rx = bus.subscribe(&[EventKind::SpeechStarted, EventKind::SilenceDetected]);
            let conversation = conversation.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(Event::SpeechStarted { ts_ms, .. }) => {
                                match conversation.state() {
                                    ConversationState::Idle
                                    | ConversationState::EvaluatingPause => {
                                        conversation
                                            .update_state(ConversationState::UserSpeaking, ts_ms);
                                        conversation.start_user_speech(ts_ms);
                                    }
                                    ConversationState::UserSpeaking => {
                                        conversation.start_user_speech(ts_ms);
                                    }
                                    // The agent holds the floor; no barge-in.
                                    _ => {}
                                }
                            }
                            Some(Event::SilenceDetected {
                                ts_ms,
                                silence_duration_ms: 0,
                                ..
                            }) => {
                                conversation.start_silence(ts_ms);
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }));
        }

        // Turn detection over silence heartbeats.
        {
            let detector = TurnDetector::new(
                config.turn,
                &config.language,
                conversation.clone(),
                bus.clone(),
            );
            let mut rx = bus.subscribe(&[EventKind::SilenceDetected]);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(Event::SilenceDetected {
                                ts_ms,
                                silence_duration_ms,
                                ..
                            }) => {
                                detector.on_silence(silence_duration_ms, ts_ms);
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }));
        }

        // Backchannel pipeline: trigger, select, time, play. All staged
        // over BACKCHANNEL_TRIGGERED, serialized on one task.
        {
            let trigger = TriggerDetector::new(
                config.backchannel.clone(),
                conversation.clone(),
                bus.clone(),
            );
            let selector = BackchannelSelector::new(
                config.backchannel.clone(),
                conversation.clone(),
                bus.clone(),
            );
            let timing = TimingController::new(config.backchannel.safe_zone_ms, bus.clone());
            let player = BackchannelPlayer::new(
                library.clone(),
                mixer.clone(),
                conversation.clone(),
                bus.clone(),
            );
            let mut rx = bus.subscribe(&[
                EventKind::SilenceDetected,
                EventKind::SpeechStarted,
                EventKind::BackchannelTriggered,
            ]);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(Event::SilenceDetected {
                                ts_ms,
                                silence_duration_ms,
                                ..
                            }) => {
                                trigger.on_silence(silence_duration_ms, ts_ms);
                            }
                            Some(Event::SpeechStarted { ts_ms, .. }) => {
                                timing.on_speech_started(ts_ms);
                            }
                            Some(Event::BackchannelTriggered {
                                ts_ms,
                                trigger_strength,
                                silence_duration_ms,
                                backchannel,
                                proceed_to_play,
                            }) => match (backchannel, proceed_to_play) {
                                (None, false) => {
                                    selector.on_triggered(
                                        trigger_strength,
                                        silence_duration_ms,
                                        ts_ms,
                                    );
                                }
                                (Some(kind), false) => {
                                    timing.on_selected(
                                        kind,
                                        trigger_strength,
                                        silence_duration_ms,
                                        ts_ms,
                                    );
                                }
                                (Some(kind), true) => {
                                    player.on_proceed(kind, ts_ms);
                                }
                                (None, true) => {}
                            },
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }));
        }

        // Response coordination: one turn at a time, run to completion.
        {
            let responder = ResponseCoordinator::new(
                config.response.clone(),
                conversation.clone(),
                collaborators.llm,
                collaborators.tts,
                mixer.clone(),
                bus.clone(),
            );
            let mut rx = bus.subscribe(&[EventKind::TurnEnded]);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(Event::TurnEnded { transcript, ts_ms, .. }) => {
                                responder.on_turn_ended(transcript, ts_ms).await;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }));
        }

        Ok(Self {
            bus,
            conversation,
            mixer,
            ingest_tx,
            cancel,
            tasks,
        })
    }

    /// Feed a float frame from the transport edge.
    pub fn push_audio(&self, samples: Vec<f32>, channels: usize, sample_rate: u32) {
        let _ = self.ingest_tx.send(IngestFrame::F32 {
            samples,
            channels,
            sample_rate,
        });
    }

    /// Feed a 16-bit PCM frame from the wire.
    pub fn push_pcm16(&self, samples: Vec<i16>, channels: usize, sample_rate: u32) {
        let _ = self.ingest_tx.send(IngestFrame::Pcm16 {
            samples,
            channels,
            sample_rate,
        });
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn conversation(&self) -> Arc<ConversationManager> {
        self.conversation.clone()
    }

    pub fn state(&self) -> ConversationState {
        self.conversation.state()
    }

    /// Mixed output stream for the transport layer (once only).
    pub fn take_output(&self) -> Option<crossbeam_channel::Receiver<Vec<f32>>> {
        self.mixer.take_receiver()
    }

    /// Peer disconnect: stop the workers, clear every buffer, and abandon
    /// outstanding collaborator calls (their results are discarded).
    pub fn shutdown(self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
        self.mixer.clear();
    }
}
