//! Status event fan-out for opsflow.
//!
//! Workers publish status changes to a topic and every observer connected to
//! that topic at the time receives them. Delivery is best-effort and
//! non-durable: there is no replay log, so an observer that connects after an
//! event was published never sees it.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{EventBus, Notifier, NotifyEvent, Topic};
//!
//! # async fn demo() {
//! let bus = EventBus::from_env();
//! let mut runs = bus.subscribe(Topic::PatchRunUpdate);
//!
//! bus.publish(
//!     Topic::PatchRunUpdate,
//!     NotifyEvent::run_update("run-1", "RUNNING", "Executing plan"),
//! );
//!
//! let event = runs.recv().await;
//! # }
//! ```
//!
//! # Configuration
//!
//! - `NOTIFY_DISABLED`: Set to "true" to drop all events
//! - `NOTIFY_BUFFER`: Per-topic buffer size (default 256)
//!
//! # Architecture
//!
//! - [`Notifier`] is the publish side injected into workers
//! - [`EventBus`] fans events out to [`Subscription`]s over broadcast channels
//! - [`RecordingNotifier`] captures events for tests

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod events;
pub mod recorder;

pub use bus::{EventBus, Subscription};
pub use events::{NotifyEvent, Topic};
pub use recorder::RecordingNotifier;

/// Publish side of the event fan-out.
///
/// Publishing never fails and never blocks on observers.
pub trait Notifier: Send + Sync {
    /// Deliver `event` to every observer currently connected to `topic`.
    fn publish(&self, topic: Topic, event: NotifyEvent);

    /// Publish on the event's own topic.
    fn emit(&self, event: NotifyEvent) {
        let topic = event.topic();
        self.publish(topic, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::AlertClustered.as_str(), "alert_clustered");
        assert_eq!(Topic::PatchRunUpdate.as_str(), "patch_run_update");
        assert_eq!(Topic::all().len(), 2);
    }

    #[test]
    fn test_event_topics_and_titles() {
        let event = NotifyEvent::clustered(true, 4, 0);
        assert_eq!(event.topic(), Topic::AlertClustered);
        assert_eq!(event.title(), "Alerts clustered: 4 clusters");

        let event = NotifyEvent::run_update("r-9", "FAILED", "step 2 failed");
        assert_eq!(event.topic(), Topic::PatchRunUpdate);
        assert_eq!(event.title(), "Patch run r-9: FAILED");
    }

    #[test]
    fn test_event_wire_shape() {
        let event = NotifyEvent::run_update("r-1", "SUCCESS", "done");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "patch_run_update");
        assert_eq!(json["run_id"], "r-1");
        assert_eq!(json["status"], "SUCCESS");

        let parsed: NotifyEvent =
            serde_json::from_str(r#"{"type":"alert_clustered","ok":true}"#).unwrap();
        assert!(matches!(parsed, NotifyEvent::AlertClustered { ok: true, clusters: 0, .. }));
    }

    #[test]
    fn test_recording_notifier_captures_in_order() {
        let recorder = RecordingNotifier::new();
        recorder.emit(NotifyEvent::run_update("a", "PENDING", "queued"));
        recorder.emit(NotifyEvent::clustered(true, 1, 0));
        recorder.emit(NotifyEvent::run_update("a", "RUNNING", "executing"));
        recorder.emit(NotifyEvent::run_update("b", "PENDING", "queued"));

        assert_eq!(recorder.events().len(), 4);
        assert_eq!(recorder.events_for(Topic::AlertClustered).len(), 1);
        assert_eq!(recorder.run_statuses("a"), vec!["PENDING", "RUNNING"]);

        recorder.clear();
        assert!(recorder.events().is_empty());
    }
}
