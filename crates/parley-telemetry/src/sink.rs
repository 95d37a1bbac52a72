//! Live log fan-out. Records flow from a tracing layer into a [`LogSink`];
//! interested parties subscribe to the sink instead of wrapping the logger.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::logging::{capture, remember_span_fields, CapturedEvent};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl From<CapturedEvent> for LogEntry {
    fn from(e: CapturedEvent) -> Self {
        Self {
            timestamp: e.timestamp,
            level: e.level,
            target: e.target,
            message: e.message,
            fields: e.fields,
            conversation_id: e.conversation_id,
            run_id: e.run_id,
        }
    }
}

/// Destination for live log records. Must not block.
pub trait LogSink: Send + Sync {
    fn publish(&self, entry: LogEntry);
}

/// Sink that fans records out to any number of subscribers. Slow
/// subscribers lag and lose records; publishers never wait.
#[derive(Clone)]
pub struct BroadcastLogSink {
    tx: broadcast::Sender<LogEntry>,
}

impl BroadcastLogSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastLogSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LogSink for BroadcastLogSink {
    fn publish(&self, entry: LogEntry) {
        // No subscribers is the common case.
        let _ = self.tx.send(entry);
    }
}

/// tracing Layer that forwards events at or above `min_level` to a [`LogSink`].
pub struct DiagnosticLogLayer {
    sink: Arc<dyn LogSink>,
    min_level: Level,
}

impl DiagnosticLogLayer {
    pub fn new(sink: Arc<dyn LogSink>, min_level: Level) -> Self {
        Self { sink, min_level }
    }
}

impl<S> Layer<S> for DiagnosticLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        if *event.metadata().level() > self.min_level {
            return;
        }
        self.sink.publish(capture(event, &ctx).into());
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        remember_span_fields(attrs, id, &ctx);
    }
}
