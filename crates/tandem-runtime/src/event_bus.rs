//! Broadcast-channel event sink.
//!
//! Publication enqueues onto a `tokio::sync::broadcast` channel and returns
//! immediately, keeping the call path non-blocking. UI layers subscribe and
//! adapt the stream however they like.

use async_trait::async_trait;
use tokio::sync::broadcast;

use tandem_core::{EventSink, RuntimeEvent};

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn on_event(&self, event: RuntimeEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
