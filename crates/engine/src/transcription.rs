//! Streaming transcription coordination.
//!
//! Overlapping audio windows go to the STT collaborator concurrently, but
//! results are applied in dispatch order: the dedup window depends on the
//! immediately prior chunk, so completion order must not leak through. A
//! sequence number per dispatch and a reorder buffer in the apply loop
//! enforce that.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parley_audio::convert;
use parley_conversation::{ConversationManager, Speaker};
use parley_events::{Event, EventBus};
use tokio::sync::mpsc;

use crate::clients::{retry_with_backoff, SpeechToText};
use crate::config::ResponseSettings;

/// Raw chunk texts remembered for dedup (compare against the last 2).
const DEDUP_MEMORY: usize = 3;
const DEDUP_COMPARE: usize = 2;

/// Fraction of the shorter word sequence an overlap must cover.
const DEDUP_OVERLAP_RATIO: f64 = 0.8;

/// Strips the text a chunk shares with its predecessors, leaving only the
/// genuinely new words.
#[derive(Debug, Default)]
pub struct Deduplicator {
    recent: VecDeque<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the overlap with recent chunk texts; returns the new suffix
    /// (possibly empty). Comparison is on lowercased words, but the
    /// surviving suffix keeps its original casing.
    pub fn dedup(&mut self, new_text: &str) -> String {
        let new_words: Vec<&str> = new_text.split_whitespace().collect();
        let new_lower: Vec<String> = new_words.iter().map(|w| w.to_lowercase()).collect();

        let mut keep_from = 0;
        if !self.recent.is_empty() && !new_lower.is_empty() {
            let window = self.recent.len().min(DEDUP_COMPARE);
            for prior in self.recent.iter().skip(self.recent.len() - window) {
                let prior_lower: Vec<String> =
                    prior.split_whitespace().map(|w| w.to_lowercase()).collect();

                if let Some(overlap) = matched_overlap(&prior_lower, &new_lower) {
                    keep_from = overlap;
                    break;
                }
            }
        }

        self.recent.push_back(new_text.to_string());
        if self.recent.len() > DEDUP_MEMORY {
            self.recent.pop_front();
        }

        new_words[keep_from..].join(" ")
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }
}

/// Two alignment passes against one prior chunk.
///
/// Pass 1 is a positional word-by-word prefix compare: a chunk whose head
/// repeats the prior chunk's head (same window, re-recognized) drops that
/// prefix. Pass 2 aligns the prior chunk's tail against the new chunk's
/// head, which is the shape a sliding window actually produces. Both accept
/// only when the overlap covers enough of the compared text to rule out
/// coincidence.
fn matched_overlap(prior: &[String], new: &[String]) -> Option<usize> {
    let positional = prior
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if positional as f64 / new.len() as f64 > DEDUP_OVERLAP_RATIO {
        return Some(positional);
    }

    let shorter = prior.len().min(new.len());
    for k in (1..=shorter).rev() {
        if prior[prior.len() - k..] == new[..k] {
            if k as f64 >= DEDUP_OVERLAP_RATIO * shorter as f64 {
                return Some(k);
            }
            break;
        }
    }
    None
}

/// Fans transcriber windows out to the STT collaborator and serializes the
/// results back into the conversation log.
pub struct TranscriptionCoordinator {
    stt: Arc<dyn SpeechToText>,
    next_seq: AtomicU64,
    results_tx: mpsc::UnboundedSender<SttResult>,
    max_attempts: u32,
    retry_base_delay: Duration,
}

struct SttResult {
    seq: u64,
    ts_ms: u64,
    text: Option<String>,
}

impl TranscriptionCoordinator {
    /// Must be called inside a tokio runtime: the apply loop is spawned
    /// here and lives until the coordinator (and its dispatch tasks) drop.
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        conversation: Arc<ConversationManager>,
        bus: Arc<EventBus>,
        settings: &ResponseSettings,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        tokio::spawn(apply_loop(results_rx, conversation, bus));

        Self {
            stt,
            next_seq: AtomicU64::new(0),
            results_tx,
            max_attempts: settings.max_attempts,
            retry_base_delay: Duration::from_millis(settings.retry_base_delay_ms),
        }
    }

    /// Send one window off for transcription. Returns immediately; the
    /// result is applied in dispatch order by the apply loop.
    pub fn dispatch(&self, chunk: Vec<f32>, ts_ms: u64) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let stt = self.stt.clone();
        let results_tx = self.results_tx.clone();
        let max_attempts = self.max_attempts;
        let base_delay = self.retry_base_delay;

        tokio::spawn(async move {
            let text = match convert::wav_bytes(&chunk) {
                Ok(wav) => {
                    match retry_with_backoff(max_attempts, base_delay, || {
                        stt.transcribe(wav.clone())
                    })
                    .await
                    {
                        Ok(text) => text,
                        Err(error) => {
                            // Exhausted retries: the chunk is discarded and
                            // downstream sees it as silence.
                            tracing::warn!(seq, %error, "discarding chunk after STT failure");
                            None
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(seq, %error, "failed to encode chunk");
                    None
                }
            };

            // The slot must reach the apply loop even when empty, or every
            // later chunk would stall in the reorder buffer.
            let _ = results_tx.send(SttResult { seq, ts_ms, text });
        });
    }
}

async fn apply_loop(
    mut results_rx: mpsc::UnboundedReceiver<SttResult>,
    conversation: Arc<ConversationManager>,
    bus: Arc<EventBus>,
) {
    let mut dedup = Deduplicator::new();
    let mut pending: BTreeMap<u64, SttResult> = BTreeMap::new();
    let mut next_apply = 0u64;

    while let Some(result) = results_rx.recv().await {
        pending.insert(result.seq, result);

        while let Some(result) = pending.remove(&next_apply) {
            next_apply += 1;

            let Some(text) = result.text else {
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }

            bus.emit(Event::PartialTranscript {
                ts_ms: result.ts_ms,
                text: text.clone(),
            });

            let new_text = dedup.dedup(&text);
            if new_text.is_empty() {
                continue;
            }

            conversation.add_transcript(&new_text, true, Speaker::User, result.ts_ms);
            bus.emit(Event::FinalTranscript {
                ts_ms: result.ts_ms,
                text: new_text,
            });
        }
    }
}
