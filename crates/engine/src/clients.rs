//! Capability traits for the network collaborators.
//!
//! Each trait carries the one method the engine actually uses, so the core
//! stays independently testable with the in-memory fakes below.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Speech-to-text over mono 16 kHz 16-bit WAV bytes. `None` means the
/// backend heard nothing in the clip.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> ClientResult<Option<String>>;
}

/// Text-to-speech returning 16-bit little-endian PCM at the collaborator's
/// native rate; the caller downsamples to the canonical rate.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> ClientResult<Option<Vec<u8>>>;

    fn sample_rate(&self) -> u32 {
        24_000
    }
}

/// Streaming chat completion over {system, …(user,assistant)*, user}.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
    ) -> ClientResult<BoxStream<'static, ClientResult<String>>>;
}

/// Retry an operation with exponential backoff: 1×, 2×, 4× the base delay.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    mut operation: F,
) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt >= max_attempts.max(1) {
                    tracing::warn!(attempt, error = %error, "giving up after retries");
                    return Err(error);
                }
                let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory fakes
// ---------------------------------------------------------------------------

/// Replays a queue of canned transcriptions, then `None` forever.
#[derive(Default)]
pub struct StaticStt {
    responses: Mutex<VecDeque<Option<String>>>,
}

impl StaticStt {
    pub fn new(responses: impl IntoIterator<Item = Option<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }
}

#[async_trait]
impl SpeechToText for StaticStt {
    async fn transcribe(&self, _wav: Vec<u8>) -> ClientResult<Option<String>> {
        Ok(self
            .responses
            .lock()
            .expect("stt fake mutex poisoned")
            .pop_front()
            .unwrap_or(None))
    }
}

/// Returns the same PCM clip for every synthesis request.
pub struct StaticTts {
    clip: Option<Vec<u8>>,
    sample_rate: u32,
}

impl StaticTts {
    pub fn new(clip: Option<Vec<u8>>, sample_rate: u32) -> Self {
        Self { clip, sample_rate }
    }

    /// A half-second clip of quiet tone-like PCM at 24 kHz.
    pub fn with_tone() -> Self {
        let samples: Vec<u8> = (0..12_000i32)
            .flat_map(|i| (((i % 64) - 32) as i16 * 256).to_le_bytes())
            .collect();
        Self::new(Some(samples), 24_000)
    }
}

#[async_trait]
impl TextToSpeech for StaticTts {
    async fn synthesize(&self, _text: &str) -> ClientResult<Option<Vec<u8>>> {
        Ok(self.clip.clone())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Streams a fixed reply word by word.
pub struct ScriptedLlm {
    reply: String,
}

impl ScriptedLlm {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn complete(
        &self,
        _messages: Vec<ChatMessage>,
    ) -> ClientResult<BoxStream<'static, ClientResult<String>>> {
        let words: Vec<ClientResult<String>> = self
            .reply
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(futures::stream::iter(words).boxed())
    }
}
