use std::fmt;
use std::time::Duration;

/// Failures reported by a model backend, before or during streaming.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::Network(_) | Self::StreamInterrupted(_)
        )
    }

    /// Short classification string for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Network(_) => "network",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Authentication(_) => "authentication",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Authentication(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotFoundKind {
    Agent,
    Tool,
    Conversation,
    Message,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Conversation => "conversation",
            Self::Message => "message",
        })
    }
}

/// Frames that are well-formed JSON but break the client protocol.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("turn {turn_id} was already accepted with different content")]
    DuplicateTurn { turn_id: String },
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Client-facing error taxonomy. Every variant has a stable code.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: NotFoundKind, id: String },
    #[error("context budget exceeded: {estimated} > {budget}")]
    BudgetExceeded { estimated: usize, budget: usize },
    #[error("upstream failure: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("not authenticated")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },
}

impl GatewayError {
    pub fn not_found(kind: NotFoundKind, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { kind, .. } => match kind {
                NotFoundKind::Agent => "AGENT_NOT_FOUND",
                NotFoundKind::Tool => "TOOL_NOT_FOUND",
                NotFoundKind::Conversation => "CONVERSATION_NOT_FOUND",
                NotFoundKind::Message => "MESSAGE_NOT_FOUND",
            },
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Protocol(v) => match v {
                ProtocolViolation::DuplicateTurn { .. } => "DUPLICATE_TURN",
                ProtocolViolation::UnknownEvent(_) => "UNKNOWN_EVENT",
                ProtocolViolation::MalformedFrame(_) => "PROTOCOL_ERROR",
            },
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Timeout { .. } => "TIMEOUT",
        }
    }

    /// Message safe to show an end user. Raw detail stays in logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(detail) => detail.clone(),
            Self::NotFound { kind, id } => format!("The requested {kind} '{id}' does not exist."),
            Self::BudgetExceeded { .. } => {
                "This conversation is too long to continue. Please start a new conversation.".into()
            }
            Self::Upstream(_) => {
                "Sorry, something went wrong while generating a response. Please try again.".into()
            }
            Self::Persistence(_) => "Your message could not be saved. Please try again.".into(),
            Self::Protocol(v) => v.to_string(),
            Self::Unauthenticated => "Authentication is required.".into(),
            Self::Forbidden(_) => "You are not allowed to do that.".into(),
            Self::Timeout { operation, .. } => format!("{operation} did not answer in time."),
        }
    }
}
