pub mod ephemeral;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parley_core::ids::{ConversationId, MessageId};
use parley_core::messages::{MessageStatus, TurnMessage};
use parley_core::store::{MessageStore, PersistenceFailure};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use self::ephemeral::{EphemeralStore, StreamingState, StreamingStatus, ThreadState, ThreadStates};

/// A run still marked streaming after this long is reported as stale.
const STALE_STREAMING_SECS: i64 = 120;

/// Mismatch only when the live layer has a count to compare.
pub fn compare(durable_count: usize, ephemeral_count: Option<usize>) -> bool {
    ephemeral_count.is_some_and(|e| e != durable_count)
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSnapshot {
    pub conversation_id: ConversationId,
    pub durable_count: usize,
    pub ephemeral_count: Option<usize>,
    pub mismatch: bool,
    pub checked_at: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: ConversationId,
    pub thread: Option<ThreadState>,
    pub runs: Vec<StreamingState>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingReport {
    pub conversation_id: ConversationId,
    pub active: Vec<StreamingState>,
    pub stale: Vec<StreamingState>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCheck {
    pub message_id: MessageId,
    pub durable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamingState>,
}

/// Outcome of writing one exchange. The user half is independent of the
/// assistant half: an assistant failure never undoes the user write.
#[derive(Debug)]
pub struct TurnWrite {
    pub user: Result<(), PersistenceFailure>,
    pub assistant: Option<Result<(), PersistenceFailure>>,
}

/// Bridges ephemeral run state and the durable message log.
pub struct StateReconciler {
    messages: Arc<dyn MessageStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    threads: ThreadStates,
    retry_delay: Duration,
}

impl StateReconciler {
    pub fn new(messages: Arc<dyn MessageStore>, ephemeral: Arc<dyn EphemeralStore>) -> Self {
        Self {
            messages,
            ephemeral,
            threads: ThreadStates::new(),
            retry_delay: Duration::from_millis(100),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn ephemeral(&self) -> &Arc<dyn EphemeralStore> {
        &self.ephemeral
    }

    /// Seed the thread state from the durable count the first time a
    /// conversation is touched.
    pub async fn ensure_seeded(&self, conversation_id: &ConversationId) -> Result<(), PersistenceFailure> {
        if self.threads.is_seeded(conversation_id) {
            return Ok(());
        }
        let count = self.messages.count(conversation_id).await?;
        self.threads.seed(conversation_id, count);
        Ok(())
    }

    /// Record that the live layer committed to a message.
    pub fn observe(&self, message: &TurnMessage) {
        self.threads.observe(&message.conversation_id, &message.id);
    }

    /// Forget the live view of a conversation that no longer exists.
    pub fn forget_thread(&self, conversation_id: &ConversationId) {
        self.threads.remove(conversation_id);
    }

    /// Forget the live view of a conversation once it has been idle for
    /// `idle` with no run streaming into it.
    pub async fn release_idle_thread(&self, conversation_id: &ConversationId, idle: Duration) -> bool {
        let streaming = self
            .ephemeral
            .for_conversation(conversation_id)
            .await
            .iter()
            .any(|s| s.status == StreamingStatus::Streaming);
        if streaming {
            return false;
        }
        self.threads.remove_idle(conversation_id, idle)
    }

    /// Write the user message, retrying once. A failed first attempt may
    /// still have landed, so the retry is skipped if the row exists.
    #[instrument(skip_all, fields(conversation_id = %message.conversation_id, message_id = %message.id))]
    pub async fn persist_user_message(&self, message: &TurnMessage) -> Result<(), PersistenceFailure> {
        let first = match self.messages.append(message).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(error = %first, "user message write failed, retrying once");
        tokio::time::sleep(self.retry_delay).await;

        if let Ok(Some(_)) = self.messages.find(&message.id).await {
            info!("user message already durable");
            return Ok(());
        }
        self.messages.append(message).await.map_err(|e| {
            error!(error = %e, "user message write failed after retry");
            e
        })
    }

    #[instrument(skip_all, fields(conversation_id = %message.conversation_id, message_id = %message.id))]
    pub async fn persist_assistant(&self, message: &TurnMessage) -> Result<(), PersistenceFailure> {
        self.messages.append(message).await.map_err(|e| {
            error!(error = %e, status = message.status.as_str(), "assistant message write failed");
            e
        })
    }

    /// Persist both halves of an exchange, user first.
    pub async fn persist_turn(&self, user: &TurnMessage, assistant: Option<&TurnMessage>) -> TurnWrite {
        let user_result = self.persist_user_message(user).await;
        if user_result.is_err() {
            return TurnWrite {
                user: user_result,
                assistant: None,
            };
        }
        let assistant = match assistant {
            Some(m) => Some(self.persist_assistant(m).await),
            None => None,
        };
        TurnWrite {
            user: user_result,
            assistant,
        }
    }

    pub async fn get_conversation_state(&self, conversation_id: &ConversationId) -> ConversationState {
        ConversationState {
            conversation_id: conversation_id.clone(),
            thread: self.threads.get(conversation_id),
            runs: self.ephemeral.for_conversation(conversation_id).await,
        }
    }

    /// Compare durable and live counts. Mismatches are logged and reported,
    /// never repaired.
    pub async fn check_state(&self, conversation_id: &ConversationId) -> Result<DiagnosticSnapshot, PersistenceFailure> {
        let durable_count = self.messages.count(conversation_id).await?;
        let ephemeral_count = self.threads.get(conversation_id).map(|t| t.message_count());
        let mismatch = compare(durable_count, ephemeral_count);
        if mismatch {
            warn!(
                conversation_id = %conversation_id,
                durable_count,
                ephemeral_count = ?ephemeral_count,
                "durable and live message counts disagree"
            );
        }
        Ok(DiagnosticSnapshot {
            conversation_id: conversation_id.clone(),
            durable_count,
            ephemeral_count,
            mismatch,
            checked_at: Utc::now().to_rfc3339(),
        })
    }

    pub async fn check_streaming(&self, conversation_id: &ConversationId) -> StreamingReport {
        let now = Utc::now();
        let (active, stale): (Vec<_>, Vec<_>) = self
            .ephemeral
            .for_conversation(conversation_id)
            .await
            .into_iter()
            .filter(|s| s.status == StreamingStatus::Streaming)
            .partition(|s| (now - s.last_update).num_seconds() < STALE_STREAMING_SECS);
        StreamingReport {
            conversation_id: conversation_id.clone(),
            active,
            stale,
        }
    }

    pub async fn message_check(&self, message_id: &MessageId) -> Result<MessageCheck, PersistenceFailure> {
        let durable = self.messages.find(message_id).await?;
        let streaming = self.ephemeral.by_message(message_id).await;
        Ok(MessageCheck {
            message_id: message_id.clone(),
            durable: durable.is_some(),
            status: durable.as_ref().map(|m| m.status),
            content_length: durable.as_ref().map(|m| m.content.len()),
            streaming,
        })
    }
}
