use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// A write or delete replicated to other execution contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Context that performed the write; receivers skip their own events.
    pub origin: String,
    pub key: String,
    /// `None` for deletes.
    pub value: Option<Value>,
    pub timestamp_ms: i64,
}

/// Cross-context pub/sub port. Delivery is best-effort and last-writer-wins.
pub trait ChangeBus: Send + Sync {
    fn publish(&self, event: ChangeEvent);

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// In-process [`ChangeBus`] backed by a tokio broadcast channel.
///
/// Clones share the same channel, so each clone can serve one context.
#[derive(Clone)]
pub struct BroadcastChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastChangeBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeBus for BroadcastChangeBus {
    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine: no other context is listening.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}
