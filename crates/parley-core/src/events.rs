use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::TokenUsage;
use crate::ids::{ClientId, ConversationId, MessageId, RunId, UserId};
use crate::messages::TurnMessage;

/// Broadcast scope a connection can join.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Thread(String),
    Conversation(ConversationId),
    DiagnosticLogs,
}

impl Topic {
    /// Parse `thread:<id>`, `conversation:<id>` or `diagnostics:logs`.
    pub fn parse(s: &str) -> Option<Self> {
        if s == "diagnostics:logs" {
            return Some(Self::DiagnosticLogs);
        }
        let (kind, id) = s.split_once(':')?;
        if id.trim().is_empty() {
            return None;
        }
        match kind {
            "thread" => Some(Self::Thread(id.to_string())),
            "conversation" => Some(Self::Conversation(ConversationId::from_raw(id))),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(id) => write!(f, "thread:{id}"),
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::DiagnosticLogs => f.write_str("diagnostics:logs"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub message_id: MessageId,
    pub run_id: RunId,
    pub conversation_id: ConversationId,
    pub chunk: String,
    pub chunk_index: u32,
    pub cumulative_length: usize,
    pub timestamp: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMetadata {
    pub chunk_count: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub message_id: MessageId,
    pub run_id: RunId,
    pub conversation_id: ConversationId,
    pub metadata: CompletionMetadata,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub is_assistant: bool,
    pub is_typing: bool,
}

/// Canonical server-to-client event. Legacy wire names are mapped onto this
/// at the connection boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    MessageNew(TurnMessage),
    MessageChunk(ChunkPayload),
    MessageComplete(CompletePayload),
    MessageError(ErrorPayload),
    Typing(TypingPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageNew(_) => "message:new",
            Self::MessageChunk(_) => "message:chunk",
            Self::MessageComplete(_) => "message:complete",
            Self::MessageError(_) => "message:error",
            Self::Typing(_) => "typing",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            Self::MessageNew(m) => serde_json::to_value(m),
            Self::MessageChunk(c) => serde_json::to_value(c),
            Self::MessageComplete(c) => serde_json::to_value(c),
            Self::MessageError(e) => serde_json::to_value(e),
            Self::Typing(t) => serde_json::to_value(t),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::MessageNew(m) => Some(&m.id),
            Self::MessageChunk(c) => Some(&c.message_id),
            Self::MessageComplete(c) => Some(&c.message_id),
            Self::MessageError(e) => e.message_id.as_ref(),
            Self::Typing(_) => None,
        }
    }
}

/// Who should receive an outbound event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Client(ClientId),
    /// Every member of any listed topic, once per connection.
    Topics { topics: Vec<Topic>, except: Option<ClientId> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboundEvent {
    pub delivery: Delivery,
    pub event: ServerEvent,
}

impl OutboundEvent {
    pub fn to_topics(topics: Vec<Topic>, event: ServerEvent) -> Self {
        Self {
            delivery: Delivery::Topics { topics, except: None },
            event,
        }
    }

    pub fn to_client(client: ClientId, event: ServerEvent) -> Self {
        Self {
            delivery: Delivery::Client(client),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_parse_and_display() {
        let t = Topic::parse("thread:42").unwrap();
        assert_eq!(t, Topic::Thread("42".into()));
        assert_eq!(t.to_string(), "thread:42");

        let c = Topic::parse("conversation:conv_1").unwrap();
        assert_eq!(c, Topic::Conversation(ConversationId::from_raw("conv_1")));
        assert_eq!(c.to_string(), "conversation:conv_1");

        assert_eq!(Topic::parse("diagnostics:logs"), Some(Topic::DiagnosticLogs));
    }

    #[test]
    fn topic_parse_rejects_garbage() {
        assert_eq!(Topic::parse("room:1"), None);
        assert_eq!(Topic::parse("thread:"), None);
        assert_eq!(Topic::parse("thread"), None);
    }

    #[test]
    fn chunk_payload_wire_shape() {
        let ev = ServerEvent::MessageChunk(ChunkPayload {
            message_id: MessageId::from_raw("a1"),
            run_id: RunId::from_raw("run_1"),
            conversation_id: ConversationId::from_raw("conv_1"),
            chunk: "Hel".into(),
            chunk_index: 0,
            cumulative_length: 3,
            timestamp: "2026-01-01T00:00:00Z".into(),
        });
        assert_eq!(ev.name(), "message:chunk");
        let v = ev.payload();
        assert_eq!(v["messageId"], "a1");
        assert_eq!(v["chunkIndex"], 0);
        assert_eq!(v["cumulativeLength"], 3);
        assert_eq!(v["chunk"], "Hel");
    }

    #[test]
    fn completion_metadata_omits_false_fallback() {
        let meta = CompletionMetadata {
            chunk_count: 2,
            duration_ms: 10,
            fallback: false,
            usage: None,
        };
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["chunkCount"], 2);
        assert!(v.get("fallback").is_none());
    }
}
