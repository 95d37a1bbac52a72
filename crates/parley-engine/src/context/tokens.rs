use parley_core::messages::TurnMessage;
use parley_core::tools::ToolDefinition;

pub const CHARS_PER_TOKEN: usize = 4;

/// Per-message framing overhead.
const MESSAGE_OVERHEAD: usize = 4;

/// Estimate token count for text content.
/// Approximation: chars / 4.
pub fn estimate_text_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Estimate tokens for a message including any attachments it carries.
pub fn estimate_message_tokens(msg: &TurnMessage) -> usize {
    let attachments: usize = msg
        .attachments
        .iter()
        .map(|a| estimate_text_tokens(&a.source) + estimate_text_tokens(&a.content))
        .sum();
    MESSAGE_OVERHEAD + estimate_text_tokens(&msg.content) + attachments
}

pub fn estimate_history_tokens(messages: &[TurnMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimate tokens for tool definitions.
pub fn estimate_tool_tokens(tools: &[ToolDefinition]) -> usize {
    tools
        .iter()
        .map(|t| {
            estimate_text_tokens(&t.name)
                + estimate_text_tokens(&t.description)
                + estimate_text_tokens(&t.parameters_schema.to_string())
        })
        .sum()
}

pub fn estimate_system_tokens(prompt: Option<&str>) -> usize {
    prompt.map(estimate_text_tokens).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::{ConversationId, MessageId, UserId};
    use parley_core::messages::Attachment;

    #[test]
    fn text_estimate_rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }

    #[test]
    fn message_estimate_counts_attachments() {
        let mut msg = TurnMessage::user(
            MessageId::from_raw("m1"),
            ConversationId::from_raw("c1"),
            UserId::from_raw("u1"),
            "abcd",
        );
        assert_eq!(estimate_message_tokens(&msg), 5);
        msg.attachments.push(Attachment {
            source: "file:a".into(),
            content: "x".repeat(40),
            truncated: false,
        });
        assert_eq!(estimate_message_tokens(&msg), 5 + 2 + 10);
    }

    #[test]
    fn tool_estimate_includes_schema() {
        let tool = ToolDefinition {
            name: "search".into(),
            description: "Search".into(),
            parameters_schema: serde_json::json!({"type": "object"}),
        };
        assert!(estimate_tool_tokens(&[tool]) > estimate_text_tokens("searchSearch"));
    }
}
