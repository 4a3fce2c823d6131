//! Runtime event definitions and bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_common::{ContainerId, ExitStatus};
use tokio::sync::broadcast;

/// Capacity of the broadcast channel; slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 1024;

/// Runtime event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// Container submitted.
    Created { id: ContainerId, timestamp: DateTime<Utc> },
    /// Entry process launched.
    Started { id: ContainerId, pid: u32, timestamp: DateTime<Utc> },
    /// Entry process terminated.
    Exited { id: ContainerId, status: ExitStatus, timestamp: DateTime<Utc> },
    /// Stop completed.
    Stopped { id: ContainerId, status: ExitStatus, timestamp: DateTime<Utc> },
    /// Start failed and was rolled back.
    Failed { id: ContainerId, reason: String, timestamp: DateTime<Utc> },
    /// Every resource released.
    Destroyed { id: ContainerId, timestamp: DateTime<Utc> },
    /// Dropped from the registry.
    Removed { id: ContainerId, timestamp: DateTime<Utc> },
}

impl RuntimeEvent {
    /// Container the event is about.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        match self {
            Self::Created { id, .. }
            | Self::Started { id, .. }
            | Self::Exited { id, .. }
            | Self::Stopped { id, .. }
            | Self::Failed { id, .. }
            | Self::Destroyed { id, .. }
            | Self::Removed { id, .. } => id,
        }
    }
}

/// Event bus for runtime events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RuntimeEvent) {
        tracing::trace!(?event, "Publishing runtime event");
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = ContainerId::from_sequence(1);

        bus.publish(RuntimeEvent::Created {
            id: id.clone(),
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.id(), &id);
        assert!(matches!(event, RuntimeEvent::Created { .. }));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        EventBus::new().publish(RuntimeEvent::Removed {
            id: ContainerId::from_sequence(9),
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = RuntimeEvent::Exited {
            id: ContainerId::from_sequence(2),
            status: ExitStatus::exited(3),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"exited\""));
    }
}
