//! Ingress buffering: the ring of recent audio plus the two chunkers that
//! feed VAD and transcription.

use std::collections::VecDeque;
use std::sync::Arc;

use parley_events::{Event, EventBus};
use serde::Deserialize;

use crate::{convert, AudioError, Result, SAMPLE_RATE};

/// Compact an accumulator once its cursor passes this many samples (1 s).
const COMPACT_THRESHOLD: usize = 16_000;

/// Audio-side configuration. Defaults match the canonical stream format.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    /// Size of the chunks handed to the VAD oracle.
    pub chunk_duration_ms: u64,
    /// Size of the windows handed to the transcriber.
    #[serde(alias = "whisper_chunk_duration_s")]
    pub transcriber_chunk_duration_s: f64,
    /// Head of each transcriber window that repeats the previous tail.
    #[serde(alias = "whisper_overlap_s")]
    pub transcriber_overlap_s: f64,
    /// How much ingress history the ring retains.
    pub ingress_capacity_s: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
            chunk_duration_ms: 30,
            transcriber_chunk_duration_s: 1.5,
            transcriber_overlap_s: 0.5,
            ingress_capacity_s: 30,
        }
    }
}

impl AudioSettings {
    pub fn vad_chunk_samples(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_duration_ms / 1000) as usize
    }

    pub fn transcriber_chunk_samples(&self) -> usize {
        (self.sample_rate as f64 * self.transcriber_chunk_duration_s) as usize
    }

    pub fn transcriber_overlap_samples(&self) -> usize {
        (self.sample_rate as f64 * self.transcriber_overlap_s) as usize
    }

    pub fn transcriber_step_samples(&self) -> usize {
        self.transcriber_chunk_samples() - self.transcriber_overlap_samples()
    }

    pub fn ingress_capacity_samples(&self) -> usize {
        (self.sample_rate as u64 * self.ingress_capacity_s) as usize
    }
}

/// Fill diagnostics for the pipeline's buffers.
#[derive(Debug, Clone, Copy)]
pub struct BufferLevels {
    pub ingress_samples: usize,
    pub vad_pending_samples: usize,
    pub transcriber_pending_samples: usize,
}

/// Fixed-size chunker over an append-only sample stream.
///
/// Cursor-based with lazy compaction, so advancing past consumed samples is
/// O(1) and memory is reclaimed in amortized batches.
struct ChunkAccumulator {
    samples: Vec<f32>,
    start: usize,
    chunk: usize,
    step: usize,
}

impl ChunkAccumulator {
    fn new(chunk: usize, step: usize) -> Self {
        Self {
            samples: Vec::new(),
            start: 0,
            chunk,
            step,
        }
    }

    fn push(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    fn pending(&self) -> usize {
        self.samples.len() - self.start
    }

    /// Next whole chunk, or None until enough samples accumulate. Never
    /// yields a partial chunk.
    fn next_chunk(&mut self) -> Option<Vec<f32>> {
        if self.pending() < self.chunk {
            return None;
        }
        let out = self.samples[self.start..self.start + self.chunk].to_vec();
        self.start += self.step;
        if self.start >= COMPACT_THRESHOLD {
            self.samples.drain(..self.start);
            self.start = 0;
        }
        Some(out)
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.start = 0;
    }
}

/// Owns the three ingress buffers and the stream clock.
///
/// Single producer (the transport edge calls `receive_*`); the VAD and
/// transcriber chunkers are drained independently of each other.
pub struct AudioPipeline {
    settings: AudioSettings,
    bus: Arc<EventBus>,
    ring: VecDeque<f32>,
    vad_chunks: ChunkAccumulator,
    transcriber_chunks: ChunkAccumulator,
    /// Total canonical-rate samples ingested since the connection opened.
    clock_samples: u64,
}

impl AudioPipeline {
    pub fn new(settings: AudioSettings, bus: Arc<EventBus>) -> Self {
        let vad_chunk = settings.vad_chunk_samples();
        let tx_chunk = settings.transcriber_chunk_samples();
        let tx_step = settings.transcriber_step_samples();
        Self {
            settings,
            bus,
            ring: VecDeque::new(),
            vad_chunks: ChunkAccumulator::new(vad_chunk, vad_chunk),
            transcriber_chunks: ChunkAccumulator::new(tx_chunk, tx_step),
            clock_samples: 0,
        }
    }

    /// Milliseconds of audio ingested so far; the engine's logical clock.
    pub fn stream_clock_ms(&self) -> u64 {
        self.clock_samples * 1000 / self.settings.sample_rate as u64
    }

    /// Accept a float frame in any channel layout / rate, normalize it to
    /// the canonical format, and append it to all three buffers.
    ///
    /// Returns the number of canonical samples appended.
    pub fn receive_frame(
        &mut self,
        samples: &[f32],
        channels: usize,
        sample_rate: u32,
    ) -> Result<usize> {
        if samples.is_empty() {
            return Err(AudioError::MalformedFrame("empty frame".into()));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(AudioError::MalformedFrame(
                "non-finite sample in frame".into(),
            ));
        }

        let normalized =
            convert::process_audio(samples, channels, sample_rate, self.settings.sample_rate);
        self.append(&normalized);
        Ok(normalized.len())
    }

    /// Accept a 16-bit PCM frame from the wire.
    pub fn receive_pcm16(
        &mut self,
        samples: &[i16],
        channels: usize,
        sample_rate: u32,
    ) -> Result<usize> {
        let float = convert::pcm16_to_f32(samples);
        self.receive_frame(&float, channels, sample_rate)
    }

    fn append(&mut self, samples: &[f32]) {
        let capacity = self.settings.ingress_capacity_samples();
        for &sample in samples {
            if self.ring.len() == capacity {
                self.ring.pop_front();
            }
            self.ring.push_back(sample);
        }

        self.vad_chunks.push(samples);
        self.transcriber_chunks.push(samples);
        self.clock_samples += samples.len() as u64;

        self.bus.emit(Event::AudioChunkReceived {
            ts_ms: self.stream_clock_ms(),
            samples: samples.len(),
            duration_ms: samples.len() as u64 * 1000 / self.settings.sample_rate as u64,
        });
    }

    /// Whole VAD-sized chunks accumulated so far.
    pub fn drain_vad_chunks(&mut self) -> impl Iterator<Item = Vec<f32>> + '_ {
        let acc = &mut self.vad_chunks;
        std::iter::from_fn(move || acc.next_chunk())
    }

    /// Whole transcriber windows accumulated so far; consecutive windows
    /// overlap by the configured amount.
    pub fn drain_transcriber_chunks(&mut self) -> impl Iterator<Item = Vec<f32>> + '_ {
        let acc = &mut self.transcriber_chunks;
        std::iter::from_fn(move || acc.next_chunk())
    }

    /// Most recent `duration_s` of ingress audio.
    pub fn recent_audio(&self, duration_s: f64) -> Vec<f32> {
        let want = (duration_s * self.settings.sample_rate as f64) as usize;
        let take = want.min(self.ring.len());
        self.ring.iter().skip(self.ring.len() - take).copied().collect()
    }

    pub fn buffer_levels(&self) -> BufferLevels {
        BufferLevels {
            ingress_samples: self.ring.len(),
            vad_pending_samples: self.vad_chunks.pending(),
            transcriber_pending_samples: self.transcriber_chunks.pending(),
        }
    }

    /// Drop all buffered audio (peer disconnect). The stream clock is kept
    /// so event timestamps stay monotonic.
    pub fn clear(&mut self) {
        self.ring.clear();
        self.vad_chunks.clear();
        self.transcriber_chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pipeline() -> AudioPipeline {
        AudioPipeline::new(AudioSettings::default(), Arc::new(EventBus::new()))
    }

    #[test]
    fn test_vad_chunk_count_matches_floor() {
        let mut pipeline = make_pipeline();
        // 1000 samples = 2 whole chunks of 480 plus a 40-sample remainder.
        pipeline.receive_frame(&vec![0.0; 1000], 1, 16_000).unwrap();

        let chunks: Vec<_> = pipeline.drain_vad_chunks().collect();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 480));
        assert_eq!(pipeline.buffer_levels().vad_pending_samples, 40);

        // The remainder completes a chunk once more audio arrives.
        pipeline.receive_frame(&vec![0.0; 440], 1, 16_000).unwrap();
        assert_eq!(pipeline.drain_vad_chunks().count(), 1);
    }

    #[test]
    fn test_transcriber_chunks_overlap_exactly() {
        let mut pipeline = make_pipeline();
        let samples: Vec<f32> = (0..48_000).map(|i| i as f32 / 48_000.0).collect();
        pipeline.receive_frame(&samples, 1, 16_000).unwrap();

        let chunks: Vec<_> = pipeline.drain_transcriber_chunks().collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 24_000);
        // The second window's head repeats the first window's 0.5 s tail.
        assert_eq!(chunks[0][16_000..], chunks[1][..8_000]);
    }

    #[test]
    fn test_stream_clock_advances_with_audio() {
        let mut pipeline = make_pipeline();
        assert_eq!(pipeline.stream_clock_ms(), 0);
        pipeline.receive_frame(&vec![0.0; 1600], 1, 16_000).unwrap();
        assert_eq!(pipeline.stream_clock_ms(), 100);
    }

    #[test]
    fn test_foreign_rate_is_resampled() {
        let mut pipeline = make_pipeline();
        let appended = pipeline
            .receive_frame(&vec![0.0; 4800], 1, 48_000)
            .unwrap();
        assert_eq!(appended, 1600);
        assert_eq!(pipeline.stream_clock_ms(), 100);
    }

    #[test]
    fn test_stereo_is_folded_to_mono() {
        let mut pipeline = make_pipeline();
        let appended = pipeline.receive_frame(&vec![0.0; 960], 2, 16_000).unwrap();
        assert_eq!(appended, 480);
    }

    #[test]
    fn test_malformed_frame_is_rejected() {
        let mut pipeline = make_pipeline();
        assert!(pipeline.receive_frame(&[], 1, 16_000).is_err());
        assert!(pipeline
            .receive_frame(&[0.1, f32::NAN, 0.2], 1, 16_000)
            .is_err());
        // Nothing was buffered.
        assert_eq!(pipeline.buffer_levels().vad_pending_samples, 0);
    }

    #[test]
    fn test_ingress_ring_is_capacity_bounded() {
        let settings = AudioSettings {
            ingress_capacity_s: 1,
            ..AudioSettings::default()
        };
        let mut pipeline = AudioPipeline::new(settings, Arc::new(EventBus::new()));
        pipeline.receive_frame(&vec![0.5; 40_000], 1, 16_000).unwrap();
        assert_eq!(pipeline.buffer_levels().ingress_samples, 16_000);
        assert_eq!(pipeline.recent_audio(2.0).len(), 16_000);
    }

    #[test]
    fn test_receive_emits_chunk_event() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe(&[parley_events::EventKind::AudioChunkReceived]);
        let mut pipeline = AudioPipeline::new(AudioSettings::default(), bus);

        pipeline.receive_frame(&vec![0.0; 480], 1, 16_000).unwrap();

        match rx.try_recv().unwrap() {
            Event::AudioChunkReceived {
                samples,
                duration_ms,
                ..
            } => {
                assert_eq!(samples, 480);
                assert_eq!(duration_ms, 30);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_clear_drops_buffers_but_keeps_clock() {
        let mut pipeline = make_pipeline();
        pipeline.receive_frame(&vec![0.0; 4800], 1, 16_000).unwrap();
        pipeline.clear();

        let levels = pipeline.buffer_levels();
        assert_eq!(levels.ingress_samples, 0);
        assert_eq!(levels.vad_pending_samples, 0);
        assert_eq!(levels.transcriber_pending_samples, 0);
        assert_eq!(pipeline.stream_clock_ms(), 300);
    }

    #[test]
    fn test_pcm16_wire_input() {
        let mut pipeline = make_pipeline();
        let frame = vec![i16::MAX / 2; 480];
        pipeline.receive_pcm16(&frame, 1, 16_000).unwrap();
        let chunk = pipeline.drain_vad_chunks().next().unwrap();
        assert!((chunk[0] - 0.5).abs() < 0.01);
    }
}
