//! In-process broadcast bus.
//!
//! One `tokio::sync::broadcast` channel per topic. Subscribers only see events
//! published after they subscribed, and a subscriber that falls more than the
//! buffer capacity behind loses the oldest events.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::events::{NotifyEvent, Topic};
use crate::Notifier;

/// Environment variable to disable all fan-out.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Environment variable for the per-topic buffer size.
const ENV_NOTIFY_BUFFER: &str = "NOTIFY_BUFFER";

/// Default per-topic buffer size.
pub const DEFAULT_BUFFER: usize = 256;

/// Topic-keyed fan-out to connected subscribers.
pub struct EventBus {
    topics: RwLock<HashMap<Topic, broadcast::Sender<NotifyEvent>>>,
    capacity: usize,
    disabled: bool,
}

impl EventBus {
    /// Create a bus with the given per-topic buffer size.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            disabled: false,
        }
    }

    /// Create a bus configured from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Event fan-out disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        let capacity = match std::env::var(ENV_NOTIFY_BUFFER) {
            Ok(raw) => raw.parse::<usize>().unwrap_or_else(|_| {
                warn!(value = %raw, "Invalid NOTIFY_BUFFER, using default");
                DEFAULT_BUFFER
            }),
            Err(_) => DEFAULT_BUFFER,
        };

        info!(capacity, "Event bus initialized");
        Self::new(capacity)
    }

    /// Create a bus that drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: 1,
            disabled: true,
        }
    }

    /// Whether fan-out is turned off.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Connect a new observer to a topic.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let sender = topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0);

        debug!(topic = %topic, "Subscriber connected");

        Subscription {
            topic,
            receiver: sender.subscribe(),
        }
    }

    /// Number of observers currently connected to a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Notifier for EventBus {
    fn publish(&self, topic: Topic, event: NotifyEvent) {
        if self.disabled {
            debug!(topic = %topic, "Fan-out disabled, skipping event");
            return;
        }

        let sender = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .cloned();

        let Some(sender) = sender else {
            debug!(topic = %topic, "No subscribers, dropping event");
            return;
        };

        match sender.send(event) {
            Ok(receivers) => debug!(topic = %topic, receivers, "Event published"),
            Err(_) => debug!(topic = %topic, "No active subscribers, dropping event"),
        }
    }
}

/// A connected observer of one topic.
pub struct Subscription {
    topic: Topic,
    receiver: broadcast::Receiver<NotifyEvent>,
}

impl Subscription {
    /// Topic this subscription listens to.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<NotifyEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<NotifyEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagged, events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(16);
        let mut early = bus.subscribe(Topic::PatchRunUpdate);

        bus.emit(NotifyEvent::run_update("r1", "PENDING", "queued"));
        let mut late = bus.subscribe(Topic::PatchRunUpdate);
        bus.emit(NotifyEvent::run_update("r1", "RUNNING", "executing"));

        let first = early.recv().await.unwrap();
        let second = early.recv().await.unwrap();
        assert!(matches!(first, NotifyEvent::PatchRunUpdate { ref status, .. } if status == "PENDING"));
        assert!(matches!(second, NotifyEvent::PatchRunUpdate { ref status, .. } if status == "RUNNING"));

        let only = late.recv().await.unwrap();
        assert!(matches!(only, NotifyEvent::PatchRunUpdate { ref status, .. } if status == "RUNNING"));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new(16);
        let mut runs = bus.subscribe(Topic::PatchRunUpdate);
        let mut clusters = bus.subscribe(Topic::AlertClustered);

        bus.emit(NotifyEvent::clustered(true, 4, 0));

        assert!(runs.try_recv().is_none());
        assert_eq!(clusters.recv().await.unwrap().topic(), Topic::AlertClustered);
    }

    #[tokio::test]
    async fn test_publish_order_preserved_per_subscriber() {
        let bus = EventBus::new(64);
        let mut sub = bus.subscribe(Topic::PatchRunUpdate);

        for i in 0..20 {
            bus.emit(NotifyEvent::run_update("r", i.to_string(), "step"));
        }

        for i in 0..20 {
            match sub.recv().await.unwrap() {
                NotifyEvent::PatchRunUpdate { status, .. } => assert_eq!(status, i.to_string()),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_newest_events() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(Topic::PatchRunUpdate);

        for i in 0..5 {
            bus.emit(NotifyEvent::run_update("r", i.to_string(), "step"));
        }

        match sub.recv().await.unwrap() {
            NotifyEvent::PatchRunUpdate { status, .. } => assert_eq!(status, "3"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(4);
        bus.emit(NotifyEvent::clustered(true, 1, 0));
        assert_eq!(bus.subscriber_count(Topic::AlertClustered), 0);
    }

    #[test]
    fn test_disabled_bus_drops_events() {
        let bus = EventBus::disabled();
        let mut sub = bus.subscribe(Topic::AlertClustered);
        bus.emit(NotifyEvent::clustered(true, 1, 0));
        assert!(bus.is_disabled());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_disabled() {
        std::env::set_var(ENV_NOTIFY_DISABLED, "1");
        let bus = EventBus::from_env();
        std::env::remove_var(ENV_NOTIFY_DISABLED);
        assert!(bus.is_disabled());
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_invalid_buffer_falls_back() {
        std::env::set_var(ENV_NOTIFY_BUFFER, "lots");
        let bus = EventBus::from_env();
        std::env::remove_var(ENV_NOTIFY_BUFFER);
        assert!(!bus.is_disabled());
        assert_eq!(bus.capacity, DEFAULT_BUFFER);
    }
}
