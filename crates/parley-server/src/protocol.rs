//! Wire frames.
//!
//! Client frames: `{ event, data?, ackId? }`. Server frames: `{ event, data }`.
//! A client frame carrying an `ackId` is answered with
//! `{ event: "ack", ackId, success, data?, error?: { code, message } }`.

use parley_core::errors::{GatewayError, ProtocolViolation};
use parley_core::events::{ServerEvent, Topic};
use parley_core::ids::{AgentId, ConversationId, MessageId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthParams;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub ack_id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ServerFrame<'a> {
    pub event: &'a str,
    pub data: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    pub event: &'static str,
    pub ack_id: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl From<&GatewayError> for WireError {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.user_message(),
        }
    }
}

impl AckFrame {
    pub fn ok(ack_id: Value, data: Value) -> Self {
        Self {
            event: "ack",
            ack_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(ack_id: Value, error: &GatewayError) -> Self {
        Self {
            event: "ack",
            ack_id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

pub fn encode_frame(event: &str, data: Value) -> Option<String> {
    serde_json::to_string(&ServerFrame { event, data }).ok()
}

pub fn encode_event(event: &ServerEvent) -> Option<String> {
    encode_frame(event.name(), event.payload())
}

pub fn encode_ack(ack: &AckFrame) -> Option<String> {
    serde_json::to_string(ack).ok()
}

/// Error frame for failures on frames that carried no `ackId`.
pub fn encode_error(event: Option<&str>, error: &GatewayError) -> Option<String> {
    let mut data = serde_json::json!({
        "code": error.code(),
        "message": error.user_message(),
    });
    if let Some(event) = event {
        data["event"] = Value::String(event.to_string());
    }
    encode_frame("error", data)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    pub id: MessageId,
    pub content: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingParams {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub is_typing: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DiagnosticCall {
    CheckState(ConversationId),
    CheckStreaming(ConversationId),
    MessageCheck(MessageId),
    ConversationState(ConversationId),
    SubscribeLogs,
    UnsubscribeLogs,
}

impl DiagnosticCall {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::CheckState(_) => "check-state",
            Self::CheckStreaming(_) => "check-streaming",
            Self::MessageCheck(_) => "message-check",
            Self::ConversationState(_) => "conversation-state",
            Self::SubscribeLogs => "subscribe-logs",
            Self::UnsubscribeLogs => "unsubscribe-logs",
        }
    }
}

/// Canonical client command. Legacy event names are translated by
/// [`crate::compat`] before decoding.
#[derive(Clone, Debug)]
pub enum ClientCommand {
    Auth(AuthParams),
    SendMessage(SendMessageParams),
    Subscribe(Topic),
    Unsubscribe(Topic),
    Typing(TypingParams),
    History(HistoryParams),
    Diagnostic(DiagnosticCall),
}

#[derive(Deserialize)]
struct TopicParams {
    topic: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationParams {
    conversation_id: ConversationId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageParams {
    message_id: MessageId,
}

impl ClientCommand {
    pub fn decode(event: &str, data: Value) -> Result<Self, GatewayError> {
        let command = match event {
            "auth" => Self::Auth(params(data)?),
            "send-message" => Self::SendMessage(params(data)?),
            "subscribe" => Self::Subscribe(topic(data)?),
            "unsubscribe" => Self::Unsubscribe(topic(data)?),
            "typing" => Self::Typing(params(data)?),
            "conversation:history" => Self::History(params(data)?),
            "diagnostic:check-state" => {
                let p: ConversationParams = params(data)?;
                Self::Diagnostic(DiagnosticCall::CheckState(p.conversation_id))
            }
            "diagnostic:check-streaming" => {
                let p: ConversationParams = params(data)?;
                Self::Diagnostic(DiagnosticCall::CheckStreaming(p.conversation_id))
            }
            "diagnostic:conversation-state" => {
                let p: ConversationParams = params(data)?;
                Self::Diagnostic(DiagnosticCall::ConversationState(p.conversation_id))
            }
            "diagnostic:message-check" => {
                let p: MessageParams = params(data)?;
                Self::Diagnostic(DiagnosticCall::MessageCheck(p.message_id))
            }
            "diagnostic:subscribe-logs" => Self::Diagnostic(DiagnosticCall::SubscribeLogs),
            "diagnostic:unsubscribe-logs" => Self::Diagnostic(DiagnosticCall::UnsubscribeLogs),
            other => return Err(ProtocolViolation::UnknownEvent(other.to_string()).into()),
        };
        Ok(command)
    }
}

fn params<T: DeserializeOwned>(data: Value) -> Result<T, GatewayError> {
    let data = if data.is_null() { Value::Object(Default::default()) } else { data };
    serde_json::from_value(data).map_err(|e| GatewayError::Validation(format!("invalid parameters: {e}")))
}

fn topic(data: Value) -> Result<Topic, GatewayError> {
    let p: TopicParams = params(data)?;
    Topic::parse(&p.topic).ok_or_else(|| GatewayError::Validation(format!("unknown topic: {}", p.topic)))
}
