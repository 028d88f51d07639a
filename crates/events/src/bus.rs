//! Central event bus for pub/sub communication between components.
//!
//! Each subscriber gets its own unbounded channel; `emit` fans an event out
//! to every subscriber of its kind under one lock, so delivery never
//! reorders events relative to an emitter. A bounded history ring retains
//! recent events for diagnostics.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::{Event, EventKind};

/// Number of events retained for diagnostics by default.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// A captured event with the wall-clock instant it was emitted.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub event: Event,
}

pub struct EventBus {
    inner: Mutex<Inner>,
}

struct Inner {
    subscribers: HashMap<EventKind, Vec<mpsc::UnboundedSender<Event>>>,
    history: VecDeque<HistoryEntry>,
    history_size: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_size(DEFAULT_HISTORY_SIZE)
    }

    pub fn with_history_size(history_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: HashMap::new(),
                history: VecDeque::with_capacity(history_size),
                history_size,
            }),
        }
    }

    /// Subscribe to the given event kinds.
    ///
    /// Returns the receiving half of a dedicated channel. Dropping the
    /// receiver unsubscribes lazily: the dead sender is swept on the next
    /// `emit` of a matching kind.
    pub fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        for kind in kinds {
            inner
                .subscribers
                .entry(*kind)
                .or_default()
                .push(tx.clone());
        }
        rx
    }

    /// Subscribe to every event kind (diagnostics, tests).
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<Event> {
        self.subscribe(&EventKind::ALL)
    }

    /// Deliver `event` to every subscriber of its kind, in subscription
    /// order. A closed subscriber is dropped without affecting the rest.
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");

        if inner.history_size > 0 {
            if inner.history.len() == inner.history_size {
                inner.history.pop_front();
            }
            inner.history.push_back(HistoryEntry {
                at: Utc::now(),
                event: event.clone(),
            });
        }

        if let Some(subs) = inner.subscribers.get_mut(&kind) {
            subs.retain(|tx| {
                if tx.send(event.clone()).is_ok() {
                    true
                } else {
                    tracing::debug!(?kind, "dropping closed event subscriber");
                    false
                }
            });
        }
    }

    /// Recent events, oldest first, optionally filtered by kind.
    pub fn history(&self, kind: Option<EventKind>) -> Vec<HistoryEntry> {
        let inner = self.inner.lock().expect("event bus mutex poisoned");
        inner
            .history
            .iter()
            .filter(|e| kind.map_or(true, |k| e.event.kind() == k))
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        inner.history.clear();
    }

    /// Live subscriber count for a kind (dead subscribers may linger until
    /// the next emit sweeps them).
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let inner = self.inner.lock().expect("event bus mutex poisoned");
        inner.subscribers.get(&kind).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_event(ts_ms: u64) -> Event {
        Event::AudioChunkReceived {
            ts_ms,
            samples: 480,
            duration_ms: 30,
        }
    }

    #[test]
    fn test_emit_reaches_subscribers_in_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe(&[EventKind::AudioChunkReceived]);
        let mut second = bus.subscribe(&[EventKind::AudioChunkReceived]);

        for ts in [0, 30, 60] {
            bus.emit(chunk_event(ts));
        }

        for rx in [&mut first, &mut second] {
            for expected in [0, 30, 60] {
                let event = rx.try_recv().unwrap();
                assert_eq!(event.ts_ms(), expected);
            }
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_subscription_filters_by_kind() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(&[EventKind::SpeechStarted]);

        bus.emit(chunk_event(0));
        bus.emit(Event::SpeechStarted {
            ts_ms: 90,
            probability: 0.8,
            resumed: false,
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), EventKind::SpeechStarted);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_does_not_block_delivery() {
        let bus = EventBus::new();
        let dead = bus.subscribe(&[EventKind::AudioChunkReceived]);
        let mut live = bus.subscribe(&[EventKind::AudioChunkReceived]);
        drop(dead);

        bus.emit(chunk_event(0));
        assert!(live.try_recv().is_ok());

        // The closed channel was swept during emit.
        assert_eq!(bus.subscriber_count(EventKind::AudioChunkReceived), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::with_history_size(3);
        for ts in 0..5 {
            bus.emit(chunk_event(ts * 30));
        }

        let history = bus.history(None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].event.ts_ms(), 60);
        assert_eq!(history[2].event.ts_ms(), 120);
    }

    #[test]
    fn test_history_filter_by_kind() {
        let bus = EventBus::new();
        bus.emit(chunk_event(0));
        bus.emit(Event::SpeechStarted {
            ts_ms: 90,
            probability: 0.9,
            resumed: true,
        });

        assert_eq!(bus.history(Some(EventKind::SpeechStarted)).len(), 1);
        assert_eq!(bus.history(None).len(), 2);

        bus.clear_history();
        assert!(bus.history(None).is_empty());
    }
}
