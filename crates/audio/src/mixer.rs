//! Two-channel additive output mixer.
//!
//! Primary carries agent speech at full amplitude; secondary carries
//! backchannels at the configured gain. A tick (driven externally at 10 ms
//! cadence) mixes whatever both queues hold and streams the result to the
//! transport over a channel.

use std::collections::VecDeque;
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};

pub struct AudioMixer {
    state: Mutex<MixerState>,
    tx: Sender<Vec<f32>>,
    secondary_gain: f32,
}

struct MixerState {
    primary: VecDeque<f32>,
    secondary: VecDeque<f32>,
    receiver: Option<Receiver<Vec<f32>>>,
}

impl AudioMixer {
    pub fn new(secondary_gain: f32) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            state: Mutex::new(MixerState {
                primary: VecDeque::new(),
                secondary: VecDeque::new(),
                receiver: Some(rx),
            }),
            tx,
            secondary_gain,
        }
    }

    /// Take the output receiver (can only be called once). The transport
    /// layer drains mixed samples from it.
    pub fn take_receiver(&self) -> Option<Receiver<Vec<f32>>> {
        self.state
            .lock()
            .expect("mixer state mutex poisoned")
            .receiver
            .take()
    }

    /// Queue agent speech at full amplitude.
    pub fn push_primary(&self, samples: &[f32]) {
        let mut state = self.state.lock().expect("mixer state mutex poisoned");
        state.primary.extend(samples.iter().copied());
    }

    /// Queue backchannel audio, attenuated by the secondary gain.
    pub fn push_secondary(&self, samples: &[f32]) {
        let gain = self.secondary_gain;
        let mut state = self.state.lock().expect("mixer state mutex poisoned");
        state.secondary.extend(samples.iter().map(|s| s * gain));
    }

    /// Mix everything currently queued: pop up to the longer queue's
    /// length from both, zero-pad the shorter, add, clip to [-1, 1], and
    /// push the block to the output channel.
    ///
    /// Returns the number of samples emitted (0 when both queues are
    /// empty).
    pub fn mix_ready(&self) -> usize {
        let mut state = self.state.lock().expect("mixer state mutex poisoned");

        let mix_len = state.primary.len().max(state.secondary.len());
        if mix_len == 0 {
            return 0;
        }

        let mut mixed = Vec::with_capacity(mix_len);
        for _ in 0..mix_len {
            let a = state.primary.pop_front().unwrap_or(0.0);
            let b = state.secondary.pop_front().unwrap_or(0.0);
            mixed.push((a + b).clamp(-1.0, 1.0));
        }

        if self.tx.send(mixed).is_err() {
            tracing::debug!("mixer output receiver dropped, discarding block");
        }
        mix_len
    }

    /// Samples waiting in (primary, secondary).
    pub fn pending(&self) -> (usize, usize) {
        let state = self.state.lock().expect("mixer state mutex poisoned");
        (state.primary.len(), state.secondary.len())
    }

    /// Drop any queued audio (connection reset).
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("mixer state mutex poisoned");
        state.primary.clear();
        state.secondary.clear();
    }
}
