//! Process-local refresh event bus.
//!
//! A bounded broadcast channel with drop-oldest semantics: subscribers that
//! fall behind lose the oldest events rather than blocking the publisher.
//! Adequate for UI push and logging; there is no broker.

use tokio::sync::broadcast;

use super::RunKind;

/// Per-subscriber channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 50;

/// Events published around each refresh run.
#[derive(Debug, Clone)]
pub enum RefreshEvent {
    RefreshStarted {
        kind: RunKind,
    },
    RefreshCompleted {
        succeeded: bool,
        error_summary: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RefreshEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.tx.subscribe()
    }

    /// Publish to all subscribers. A send with no receivers is not an error.
    pub fn publish(&self, event: RefreshEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
