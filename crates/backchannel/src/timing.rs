//! Safe-zone timing: commit to a backchannel only if the user stays quiet.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_events::{BackchannelKind, Event, EventBus};
use tokio::task::JoinHandle;

/// One selected backchannel waiting out its safe zone.
struct Pending {
    kind: BackchannelKind,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Holds at most one pending backchannel. The safe-zone timer either
/// elapses (re-emitting the trigger with `proceed_to_play`) or is cancelled
/// by resumed speech. A newer trigger supersedes the pending one.
pub struct TimingController {
    safe_zone_ms: u64,
    bus: Arc<EventBus>,
    pending: Arc<Mutex<Option<Pending>>>,
    generation: std::sync::atomic::AtomicU64,
}

impl TimingController {
    pub fn new(safe_zone_ms: u64, bus: Arc<EventBus>) -> Self {
        Self {
            safe_zone_ms,
            bus,
            pending: Arc::new(Mutex::new(None)),
            generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().expect("timing mutex poisoned").is_some()
    }

    /// Handle a selected (second-stage) BACKCHANNEL_TRIGGERED. Must run
    /// inside a tokio runtime: the safe-zone countdown is a spawned task.
    pub fn on_selected(
        &self,
        kind: BackchannelKind,
        trigger_strength: f32,
        silence_duration_ms: u64,
        ts_ms: u64,
    ) {
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;

        let mut pending = self.pending.lock().expect("timing mutex poisoned");
        if let Some(old) = pending.take() {
            tracing::debug!(old = %old.kind, new = %kind, "superseding pending backchannel");
            old.handle.abort();
        }

        let bus = self.bus.clone();
        let slot = self.pending.clone();
        let safe_zone_ms = self.safe_zone_ms;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(safe_zone_ms)).await;

            let mut pending = slot.lock().expect("timing mutex poisoned");
            let still_current = pending
                .as_ref()
                .map_or(false, |p| p.generation == generation);
            if !still_current {
                return;
            }
            *pending = None;
            drop(pending);

            bus.emit(Event::BackchannelTriggered {
                ts_ms,
                trigger_strength,
                silence_duration_ms,
                backchannel: Some(kind),
                proceed_to_play: true,
            });
        });

        *pending = Some(Pending {
            kind,
            generation,
            handle,
        });
    }

    /// The user resumed speaking: cancel whatever is pending.
    pub fn on_speech_started(&self, ts_ms: u64) {
        let cancelled = {
            let mut pending = self.pending.lock().expect("timing mutex poisoned");
            pending.take()
        };

        if let Some(pending) = cancelled {
            pending.handle.abort();
            tracing::debug!(kind = %pending.kind, "backchannel aborted, user resumed");
            self.bus.emit(Event::BackchannelAborted {
                ts_ms,
                backchannel: pending.kind,
                reason: "user_resumed_speaking".to_string(),
            });
        }
    }
}
