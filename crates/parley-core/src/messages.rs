use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, RunId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Lifecycle status of a message as seen by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Streaming,
    Sent,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "streaming" => Some(Self::Streaming),
            "sent" => Some(Self::Sent),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Resolved mention content or tool output carried alongside a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Where the content came from, e.g. `file:README.md` or `tool:search`.
    pub source: String,
    pub content: String,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MessageInvariant {
    #[error("user message {0} cannot be in streaming state")]
    StreamingUserMessage(MessageId),
    #[error("message {0} has empty content")]
    EmptyContent(MessageId),
}

impl TurnMessage {
    pub fn user(
        id: MessageId,
        conversation_id: ConversationId,
        user_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            role: Role::User,
            content: content.into(),
            status: MessageStatus::Sent,
            created_at: Utc::now().to_rfc3339(),
            user_id: Some(user_id),
            run_id: None,
            attachments: Vec::new(),
        }
    }

    /// Placeholder for an assistant reply that is about to stream.
    pub fn streaming_placeholder(id: MessageId, conversation_id: ConversationId, run_id: RunId) -> Self {
        Self {
            id,
            conversation_id,
            role: Role::Assistant,
            content: String::new(),
            status: MessageStatus::Streaming,
            created_at: Utc::now().to_rfc3339(),
            user_id: None,
            run_id: Some(run_id),
            attachments: Vec::new(),
        }
    }

    pub fn system(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            role: Role::System,
            content: content.into(),
            status: MessageStatus::Sent,
            created_at: Utc::now().to_rfc3339(),
            user_id: None,
            run_id: None,
            attachments: Vec::new(),
        }
    }

    /// Copy of this message with final content and status, keeping id and run.
    pub fn finalized(&self, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            content: content.into(),
            status,
            created_at: Utc::now().to_rfc3339(),
            ..self.clone()
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// Checked by stores before anything becomes durable.
    pub fn validate(&self) -> Result<(), MessageInvariant> {
        if self.role == Role::User && self.status == MessageStatus::Streaming {
            return Err(MessageInvariant::StreamingUserMessage(self.id.clone()));
        }
        if self.role == Role::User && self.content.trim().is_empty() {
            return Err(MessageInvariant::EmptyContent(self.id.clone()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub owner: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: String,
}

impl Conversation {
    pub fn new(owner: UserId) -> Self {
        Self {
            id: ConversationId::new(),
            owner,
            title: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}
