//! Recording notifier for tests and dry runs.

use std::sync::{Mutex, PoisonError};

use crate::events::{NotifyEvent, Topic};
use crate::Notifier;

/// Captures every published event in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(Topic, NotifyEvent)>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured events in publish order.
    #[must_use]
    pub fn events(&self) -> Vec<(Topic, NotifyEvent)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Captured events for one topic.
    #[must_use]
    pub fn events_for(&self, topic: Topic) -> Vec<NotifyEvent> {
        self.events()
            .into_iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, e)| e)
            .collect()
    }

    /// Statuses published for a single run, in order.
    #[must_use]
    pub fn run_statuses(&self, run_id: &str) -> Vec<String> {
        self.events_for(Topic::PatchRunUpdate)
            .into_iter()
            .filter_map(|event| match event {
                NotifyEvent::PatchRunUpdate {
                    run_id: id, status, ..
                } if id == run_id => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Drop everything captured so far.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, topic: Topic, event: NotifyEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic, event));
    }
}
