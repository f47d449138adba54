//! Fan-out of lifecycle and metrics events to realtime subscribers.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use wahub_common::LifecycleEvent;

/// Broadcasts serialized events to every live subscriber. Events are
/// serialized once per broadcast, not per subscriber. A closed receiver is
/// skipped without being removed; subscriptions are only pruned through
/// `unsubscribe`.
#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: DashMap<Uuid, mpsc::UnboundedSender<String>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        debug!(subscriber = %id, total = self.subscribers.len(), "event subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.remove(&id).is_some() {
            debug!(subscriber = %id, total = self.subscribers.len(), "event subscriber removed");
        }
    }

    pub fn broadcast(&self, event: &LifecycleEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("failed to serialize event: {e}");
                return;
            }
        };
        for entry in self.subscribers.iter() {
            if entry.value().send(payload.clone()).is_err() {
                debug!(subscriber = %entry.key(), "dropping event for closed subscriber");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
