//! In-memory library of pre-decoded backchannel clips.
//!
//! Clips are loaded once at startup from a directory of WAV files named
//! after their kind (`mmhmm.wav`, `okay.wav`, …), validated against the
//! canonical format, and amplitude-scaled so playback is a straight copy
//! into the mixer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parley_audio::SAMPLE_RATE;
use parley_events::BackchannelKind;

use crate::{BackchannelError, Result};

pub struct BackchannelLibrary {
    clips: HashMap<BackchannelKind, Arc<Vec<f32>>>,
}

impl BackchannelLibrary {
    /// Load every recognized WAV in `dir`, scaling samples by `volume`.
    ///
    /// Files with unknown stems are ignored; files with the wrong format
    /// are skipped with a warning rather than failing the whole library.
    pub fn load_dir(dir: &Path, volume: f32) -> Result<Self> {
        let mut clips = HashMap::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wav") {
                continue;
            }
            let Some(kind) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(BackchannelKind::from_stem)
            else {
                tracing::debug!(path = %path.display(), "ignoring unrecognized wav");
                continue;
            };

            match load_wav(&path, volume) {
                Ok(samples) => {
                    tracing::info!(
                        kind = %kind,
                        duration_ms = samples.len() as u64 * 1000 / SAMPLE_RATE as u64,
                        "loaded backchannel clip"
                    );
                    clips.insert(kind, Arc::new(samples));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping clip");
                }
            }
        }

        Ok(Self { clips })
    }

    /// Build a library from raw clips (tests, synthetic assets).
    pub fn from_clips(clips: impl IntoIterator<Item = (BackchannelKind, Vec<f32>)>) -> Self {
        Self {
            clips: clips
                .into_iter()
                .map(|(kind, samples)| (kind, Arc::new(samples)))
                .collect(),
        }
    }

    pub fn clip(&self, kind: BackchannelKind) -> Option<Arc<Vec<f32>>> {
        self.clips.get(&kind).cloned()
    }

    pub fn duration_ms(&self, kind: BackchannelKind) -> Option<u64> {
        self.clips
            .get(&kind)
            .map(|clip| clip.len() as u64 * 1000 / SAMPLE_RATE as u64)
    }

    pub fn kinds(&self) -> Vec<BackchannelKind> {
        self.clips.keys().copied().collect()
    }

    /// Every kind must be present for full coverage.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<BackchannelKind> = BackchannelKind::ALL
            .into_iter()
            .filter(|kind| !self.clips.contains_key(kind))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BackchannelError::MissingClips(missing))
        }
    }
}

fn load_wav(path: &Path, volume: f32) -> Result<Vec<f32>> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    if spec.channels != 1
        || spec.sample_rate != SAMPLE_RATE
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(BackchannelError::BadFormat {
            path: path.display().to_string(),
            detail: format!(
                "{} ch, {} Hz, {} bit",
                spec.channels, spec.sample_rate, spec.bits_per_sample
            ),
        });
    }

    let samples: std::result::Result<Vec<i16>, _> = reader.into_samples::<i16>().collect();
    Ok(samples?
        .into_iter()
        .map(|s| s as f32 / 32768.0 * volume)
        .collect())
}
