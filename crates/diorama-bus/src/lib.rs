use std::collections::HashMap;
use std::sync::Arc;

use diorama_schema::SceneEvent;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

type Subscriber = mpsc::Sender<SceneEvent>;

/// Fan-out of scene events to connected viewers, keyed by viewer id so a
/// freshly joined viewer can be addressed individually. Slow viewers lose
/// events rather than stalling the orchestrator.
pub struct ViewerHub {
    subscribers: Arc<RwLock<HashMap<String, Subscriber>>>,
    capacity: usize,
}

impl ViewerHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Register a viewer and hand back its event stream. Re-subscribing an
    /// existing id replaces the previous stream.
    pub async fn subscribe(&self, viewer_id: &str) -> mpsc::Receiver<SceneEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write().await;
        subs.insert(viewer_id.to_string(), tx);
        rx
    }

    pub async fn unsubscribe(&self, viewer_id: &str) {
        let mut subs = self.subscribers.write().await;
        subs.remove(viewer_id);
    }

    pub async fn viewer_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver an event to one viewer. Unknown ids and full channels are
    /// dropped silently apart from a log line.
    pub async fn send_to(&self, viewer_id: &str, event: SceneEvent) {
        let subs = self.subscribers.read().await;
        if let Some(tx) = subs.get(viewer_id) {
            if tx.try_send(event).is_err() {
                warn!(viewer_id, "viewer channel full, dropping event");
            }
        }
    }

    /// Deliver an event to every connected viewer.
    pub async fn broadcast(&self, event: SceneEvent) {
        let subs = self.subscribers.read().await;
        for (viewer_id, tx) in subs.iter() {
            if tx.try_send(event.clone()).is_err() {
                warn!(viewer_id, "viewer channel full, dropping event");
            }
        }
    }
}
