//! In-process event bus: the push delivery path.
//!
//! Lifecycle events are published in commit order right after the store
//! transaction that produced them. Subscribers receive at-least-once within
//! a subscription; per-request ordering is monotone because publication
//! follows commit order on a single broker. Watchers in other processes use
//! the polling path in [`crate::watcher`] instead.

use slb_protocol::Event;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. A bus with no subscribers simply
    /// drops the event; the store remains the source of truth.
    pub fn publish(&self, event: Event) {
        let receivers = self.tx.receiver_count();
        if receivers > 0 {
            if let Err(e) = self.tx.send(event) {
                tracing::debug!("event bus send failed: {e}");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
