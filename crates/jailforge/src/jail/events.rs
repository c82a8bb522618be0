//! Jail lifecycle events and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Jail lifecycle event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JailEvent {
    /// About to run `jail -c`.
    BeforeStart { name: String, timestamp: i64 },
    /// Jail created and facts loaded.
    Started { name: String, jid: u32, timestamp: i64 },
    /// About to run `jail -r`.
    BeforeStop { name: String, timestamp: i64 },
    /// Jail removed.
    Stopped { name: String, timestamp: i64 },
}

impl JailEvent {
    /// Name of the jail the event is about.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::BeforeStart { name, .. }
            | Self::Started { name, .. }
            | Self::BeforeStop { name, .. }
            | Self::Stopped { name, .. } => name,
        }
    }
}

/// Event bus for jail lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JailEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
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
    pub fn subscribe(&self) -> broadcast::Receiver<JailEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: JailEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

/// Seconds since the epoch.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
