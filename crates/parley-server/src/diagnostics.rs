//! Operator diagnostic calls. Each call is read-only and bounded by a
//! timeout; its pending reply slot is released whether it answers or not.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parley_core::errors::GatewayError;
use parley_core::ids::ClientId;
use parley_engine::StateReconciler;
use serde::Serialize;
use serde_json::Value;

use crate::protocol::DiagnosticCall;

#[derive(Clone, Debug)]
struct PendingReply {
    client_id: ClientId,
    operation: &'static str,
    started: Instant,
}

/// Removes its pending entry when dropped, including when the call is
/// abandoned by a timeout.
struct ReplySlot {
    id: u64,
    pending: Arc<DashMap<u64, PendingReply>>,
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct DiagnosticDesk {
    reconciler: Arc<StateReconciler>,
    timeout: Duration,
    pending: Arc<DashMap<u64, PendingReply>>,
    next_id: AtomicU64,
}

impl DiagnosticDesk {
    pub fn new(reconciler: Arc<StateReconciler>, timeout: Duration) -> Self {
        Self {
            reconciler,
            timeout,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Calls currently awaiting an answer.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_for(&self, client_id: &ClientId) -> usize {
        self.pending.iter().filter(|p| p.client_id == *client_id).count()
    }

    /// Run one read-only diagnostic query. Log subscription calls are
    /// membership changes and are handled by the caller.
    pub async fn run(&self, client_id: &ClientId, call: DiagnosticCall) -> Result<Value, GatewayError> {
        let reconciler = Arc::clone(&self.reconciler);
        let operation = call.operation();
        self.bounded(client_id, operation, async move {
            match call {
                DiagnosticCall::CheckState(conversation_id) => to_value(
                    reconciler
                        .check_state(&conversation_id)
                        .await
                        .map_err(|e| GatewayError::Persistence(e.to_string()))?,
                ),
                DiagnosticCall::CheckStreaming(conversation_id) => {
                    to_value(reconciler.check_streaming(&conversation_id).await)
                }
                DiagnosticCall::ConversationState(conversation_id) => {
                    to_value(reconciler.get_conversation_state(&conversation_id).await)
                }
                DiagnosticCall::MessageCheck(message_id) => to_value(
                    reconciler
                        .message_check(&message_id)
                        .await
                        .map_err(|e| GatewayError::Persistence(e.to_string()))?,
                ),
                DiagnosticCall::SubscribeLogs | DiagnosticCall::UnsubscribeLogs => {
                    Err(GatewayError::Validation(format!("{operation} is not a query")))
                }
            }
        })
        .await
    }

    /// Await `work` for at most the configured timeout. The reply slot is
    /// held for the duration of the call and freed on every exit path.
    pub async fn bounded<F>(&self, client_id: &ClientId, operation: &'static str, work: F) -> Result<Value, GatewayError>
    where
        F: Future<Output = Result<Value, GatewayError>> + Send,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            id,
            PendingReply {
                client_id: client_id.clone(),
                operation,
                started: Instant::now(),
            },
        );
        let _slot = ReplySlot {
            id,
            pending: Arc::clone(&self.pending),
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                let after_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(client_id = %client_id, operation, after_ms, "diagnostic call timed out");
                Err(GatewayError::Timeout {
                    operation: format!("diagnostic:{operation}"),
                    after_ms,
                })
            }
        }
    }

    /// Longest-running pending call, for health reporting.
    pub fn oldest_pending(&self) -> Option<(&'static str, Duration)> {
        self.pending
            .iter()
            .map(|p| (p.operation, p.started.elapsed()))
            .max_by_key(|(_, age)| *age)
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, GatewayError> {
    serde_json::to_value(value).map_err(|e| GatewayError::Validation(format!("unserializable report: {e}")))
}
