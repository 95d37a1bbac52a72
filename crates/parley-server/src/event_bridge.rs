use std::sync::Arc;

use parley_core::events::{OutboundEvent, Topic};
use parley_telemetry::LogEntry;
use tokio::sync::broadcast;

use crate::client::ConnectionRegistry;
use crate::protocol;

/// Wire event carrying one live log record.
pub const LOG_EVENT: &str = "diagnostic:log";

/// Subscribes to the engine's event bus and delivers each event to the
/// connections it is addressed to.
pub struct EventBridge {
    registry: Arc<ConnectionRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn start(&self, mut rx: broadcast::Receiver<OutboundEvent>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        registry.deliver(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

pub fn create_bridge(registry: Arc<ConnectionRegistry>, rx: broadcast::Receiver<OutboundEvent>) -> tokio::task::JoinHandle<()> {
    EventBridge::new(registry).start(rx)
}

/// Forward live log records to connections joined to `diagnostics:logs`.
///
/// Lag is counted but not logged: a warning here would itself be forwarded.
pub fn create_log_bridge(registry: Arc<ConnectionRegistry>, mut rx: broadcast::Receiver<LogEntry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let topics = [Topic::DiagnosticLogs];
        let mut lagged: u64 = 0;
        loop {
            match rx.recv().await {
                Ok(entry) => {
                    if is_own_record(&entry) {
                        continue;
                    }
                    let data = serde_json::to_value(&entry).unwrap_or_default();
                    if let Some(frame) = protocol::encode_frame(LOG_EVENT, data) {
                        registry.broadcast(&topics, None, &frame);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => lagged += n,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!(lagged, "log bridge stopped");
    })
}

/// Records produced while delivering records are not delivered again.
fn is_own_record(entry: &LogEntry) -> bool {
    entry.target.starts_with("parley_server::event_bridge") || entry.target.starts_with("parley_server::client")
}
