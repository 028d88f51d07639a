//! Sample-format conversion: mono fold-down, resampling, PCM and WAV
//! encodings for the wire boundaries.

use std::borrow::Cow;
use std::io::Cursor;

use rubato::{FftFixedIn, Resampler as RubatoResampler};

use crate::{AudioError, Result, SAMPLE_RATE};

/// Convert to mono and resample in a single pass when possible.
/// Uses Cow to avoid allocation when no processing is needed.
pub fn process_audio<'a>(
    samples: &'a [f32],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
) -> Cow<'a, [f32]> {
    let needs_mono = channels > 1;
    let needs_resample = from_rate != to_rate;

    match (needs_mono, needs_resample) {
        (false, false) => Cow::Borrowed(samples),
        (true, false) => Cow::Owned(to_mono(samples, channels)),
        (false, true) => Cow::Owned(resample_linear(samples, from_rate, to_rate)),
        (true, true) => Cow::Owned(resample_linear(
            &to_mono(samples, channels),
            from_rate,
            to_rate,
        )),
    }
}

/// Average interleaved channels down to one.
pub fn to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let inv_channels = 1.0 / channels as f32;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * inv_channels)
        .collect()
}

/// Linear-interpolation resampling. Stateless; fine for one-shot clips and
/// as the fallback when the sinc resampler cannot be constructed.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = src_idx.fract() as f32;
        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else if idx < samples.len() {
            samples[idx]
        } else {
            0.0
        };
        output.push(sample);
    }
    output
}

/// Stateful high-quality resampler with buffering for variable input sizes.
///
/// Wraps rubato's FFT resampler; input is accumulated into fixed chunks, so
/// a trailing sub-chunk remainder stays buffered until more samples arrive.
pub struct StreamResampler {
    resampler: FftFixedIn<f32>,
    input_buffer: Vec<f32>,
    chunk_size: usize,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let chunk_size = 256;

        let resampler = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            chunk_size,
            2, // Sub-chunks for better quality
            1, // Mono
        )
        .map_err(|e| AudioError::Resampler(e.to_string()))?;

        Ok(Self {
            resampler,
            input_buffer: Vec::with_capacity(chunk_size * 2),
            chunk_size,
        })
    }

    /// Feed input samples; returns whatever output is ready.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.input_buffer.extend_from_slice(samples);

        let mut output = Vec::new();
        while self.input_buffer.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.input_buffer.drain(..self.chunk_size).collect();
            if let Ok(resampled) = self.resampler.process(&[chunk], None) {
                if !resampled.is_empty() {
                    output.extend_from_slice(&resampled[0]);
                }
            }
        }
        output
    }
}

/// Resample a whole clip at once, preferring the sinc resampler and falling
/// back to linear interpolation.
pub fn resample_clip(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }
    match StreamResampler::new(from_rate, to_rate) {
        Ok(mut resampler) => {
            let mut output = resampler.process(samples);
            // Flush the tail with silence so the final chunk drains.
            output.extend(resampler.process(&vec![0.0; 256]));
            output
        }
        Err(e) => {
            tracing::warn!(error = %e, "sinc resampler unavailable, using linear");
            resample_linear(samples, from_rate, to_rate)
        }
    }
}

/// Decode little-endian 16-bit PCM bytes to float samples.
pub fn pcm16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Encode float samples as a mono 16 kHz 16-bit WAV file in memory, the
/// wire format the transcription collaborator expects.
pub fn wav_bytes(samples: &[f32]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_mono_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(to_mono(&stereo, 2), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_process_audio_borrows_when_canonical() {
        let samples = [0.1f32, 0.2, 0.3];
        let out = process_audio(&samples, 1, SAMPLE_RATE, SAMPLE_RATE);
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn test_resample_linear_halves_length() {
        let samples = vec![0.0f32; 480];
        let out = resample_linear(&samples, 32_000, 16_000);
        assert_eq!(out.len(), 240);
    }

    #[test]
    fn test_resample_linear_identity() {
        let samples = vec![0.25f32; 100];
        assert_eq!(resample_linear(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn test_pcm16_roundtrip() {
        let samples = vec![0.0, 0.5, -0.5, 0.999];
        let ints = f32_to_pcm16(&samples);
        let back = pcm16_to_f32(&ints);
        for (a, b) in samples.iter().zip(&back) {
            assert!((a - b).abs() < 0.001);
        }
    }

    #[test]
    fn test_pcm16_bytes_decode() {
        let bytes = [0x00, 0x40, 0x00, 0xC0]; // 16384, -16384
        let samples = pcm16_bytes_to_f32(&bytes);
        assert!((samples[0] - 0.5).abs() < 0.001);
        assert!((samples[1] + 0.5).abs() < 0.001);
    }

    #[test]
    fn test_wav_bytes_header_and_length() {
        let samples = vec![0.0f32; 160];
        let bytes = wav_bytes(&samples).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        // 44-byte canonical header + 2 bytes per sample.
        assert_eq!(bytes.len(), 44 + 320);
    }

    #[test]
    fn test_resample_clip_24k_to_16k_ratio() {
        let clip = vec![0.1f32; 24_000];
        let out = resample_clip(&clip, 24_000, 16_000);
        // Two-thirds length, within resampler edge tolerance.
        assert!((out.len() as i64 - 16_000).unsigned_abs() < 600);
    }
}
