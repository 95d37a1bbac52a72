use parley_core::events::{OutboundEvent, ServerEvent, Topic};
use tokio::sync::broadcast;
use tracing::trace;

/// Fan-out point between the engine and the connection layer. The engine
/// publishes addressed events; the server's bridge delivers them.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OutboundEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns false when nobody is listening, which is
    /// not an error: events for absent clients are dropped.
    pub fn publish(&self, event: OutboundEvent) -> bool {
        let name = event.event.name();
        match self.tx.send(event) {
            Ok(n) => {
                trace!(event = name, receivers = n, "published");
                true
            }
            Err(_) => false,
        }
    }

    pub fn to_topics(&self, topics: &[Topic], event: ServerEvent) -> bool {
        self.publish(OutboundEvent::to_topics(topics.to_vec(), event))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
