//! Collaborator interfaces for durable state. Implementations live in
//! `parley-store`; tests substitute in-memory doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, ConversationId, MessageId, UserId};
use crate::messages::{Conversation, TurnMessage};

#[derive(Clone, Debug, thiserror::Error)]
#[error("persistence failure: {0}")]
pub struct PersistenceFailure(pub String);

impl PersistenceFailure {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// Append-only, per-conversation ordered message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &TurnMessage) -> Result<(), PersistenceFailure>;

    /// Most recent `limit` messages in append order.
    async fn list(&self, conversation_id: &ConversationId, limit: usize) -> Result<Vec<TurnMessage>, PersistenceFailure>;

    async fn count(&self, conversation_id: &ConversationId) -> Result<usize, PersistenceFailure>;

    async fn find(&self, message_id: &MessageId) -> Result<Option<TurnMessage>, PersistenceFailure>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, conversation: &Conversation) -> Result<(), PersistenceFailure>;

    async fn get(&self, id: &ConversationId) -> Result<Option<Conversation>, PersistenceFailure>;

    /// Remove a conversation that holds no messages. Returns false if it was
    /// missing or not empty.
    async fn discard_empty(&self, id: &ConversationId) -> Result<bool, PersistenceFailure>;
}

/// Original copy of a tool output that was truncated for the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub conversation_id: ConversationId,
    pub turn_id: MessageId,
    pub source: String,
    pub original: String,
    pub original_bytes: usize,
    pub truncated_bytes: usize,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), PersistenceFailure>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Connect,
    Auth,
    AuthRejected,
    Disconnect,
}

impl ConnectionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Auth => "auth",
            Self::AuthRejected => "auth_rejected",
            Self::Disconnect => "disconnect",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub kind: ConnectionEventKind,
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub timestamp: String,
}

impl ConnectionEvent {
    pub fn new(kind: ConnectionEventKind, client_id: ClientId) -> Self {
        Self {
            kind,
            client_id,
            user_id: None,
            reason: None,
            duration_ms: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

/// Sink for connection lifecycle events. Callers treat failures as non-fatal.
#[async_trait]
pub trait ConnectionLog: Send + Sync {
    async fn record(&self, event: ConnectionEvent) -> Result<(), PersistenceFailure>;
}
