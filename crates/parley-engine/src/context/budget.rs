use parley_core::context::{Annotation, AnnotationKind, BudgetStats};
use parley_core::ids::MessageId;
use parley_core::messages::TurnMessage;
use parley_core::tools::ToolDefinition;

use super::tokens::{estimate_history_tokens, estimate_system_tokens, estimate_text_tokens, estimate_tool_tokens};
use crate::error::EngineError;
use crate::truncate::{max_bytes_for_tokens, truncate_output};

#[derive(Clone, Copy, Debug)]
pub struct BudgetLimits {
    pub max_context_tokens: usize,
    pub max_tool_output_tokens: usize,
}

/// Untruncated content removed from the package, destined for the audit log.
#[derive(Clone, Debug, PartialEq)]
pub struct TruncatedOutput {
    pub message_id: MessageId,
    pub source: String,
    pub original: String,
    pub original_bytes: usize,
    pub truncated_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct Fitted {
    pub messages: Vec<TurnMessage>,
    pub stats: BudgetStats,
    pub truncated: Vec<TruncatedOutput>,
    pub annotations: Vec<Annotation>,
}

/// Truncate the current turn's oversized attachments in place, returning the
/// originals. Earlier turns were fitted when they were current and are left
/// as stored.
fn truncate_attachments(messages: &mut [TurnMessage], current: &MessageId, max_tokens: usize) -> Vec<TruncatedOutput> {
    let max_bytes = max_bytes_for_tokens(max_tokens);
    let mut removed = Vec::new();
    for msg in messages.iter_mut().filter(|m| m.id == *current) {
        for attachment in msg.attachments.iter_mut() {
            if attachment.truncated || estimate_text_tokens(&attachment.content) <= max_tokens {
                continue;
            }
            let truncated = truncate_output(&attachment.content, max_bytes);
            let original = std::mem::replace(&mut attachment.content, truncated);
            attachment.truncated = true;
            removed.push(TruncatedOutput {
                message_id: msg.id.clone(),
                source: attachment.source.clone(),
                original_bytes: original.len(),
                truncated_bytes: attachment.content.len(),
                original,
            });
        }
    }
    removed
}

/// Fit a turn under the token budget.
///
/// Oversized attachments are truncated first. Then the oldest non-system
/// messages are pruned until the estimate fits. System messages and the
/// current turn are never pruned; if they alone exceed the budget the turn
/// is rejected.
pub fn fit_to_budget(
    system_prompt: Option<&str>,
    tools: &[ToolDefinition],
    mut messages: Vec<TurnMessage>,
    current: &MessageId,
    limits: BudgetLimits,
) -> Result<Fitted, EngineError> {
    let system_tokens = estimate_system_tokens(system_prompt);
    let tool_tokens = estimate_tool_tokens(tools);
    let fixed = system_tokens + tool_tokens;
    let estimated_before = fixed + estimate_history_tokens(&messages);

    let truncated = truncate_attachments(&mut messages, current, limits.max_tool_output_tokens);
    let mut annotations: Vec<Annotation> = truncated
        .iter()
        .map(|t| {
            Annotation::new(
                AnnotationKind::OutputTruncated,
                format!("{}: {} -> {} bytes", t.source, t.original_bytes, t.truncated_bytes),
            )
        })
        .collect();

    let mut history_tokens = estimate_history_tokens(&messages);
    let mut pruned = 0;
    while fixed + history_tokens > limits.max_context_tokens {
        let Some(idx) = messages.iter().position(|m| !m.is_system() && m.id != *current) else {
            return Err(EngineError::BudgetExceededAfterPruning {
                estimated: fixed + history_tokens,
                budget: limits.max_context_tokens,
            });
        };
        messages.remove(idx);
        pruned += 1;
        history_tokens = estimate_history_tokens(&messages);
    }
    if pruned > 0 {
        annotations.push(Annotation::new(
            AnnotationKind::HistoryPruned,
            format!("{pruned} older messages dropped"),
        ));
    }

    Ok(Fitted {
        stats: BudgetStats {
            budget: limits.max_context_tokens,
            estimated_before,
            estimated_after: fixed + history_tokens,
            system_tokens,
            tool_tokens,
            history_tokens,
            pruned_messages: pruned,
            truncated_outputs: truncated.len(),
        },
        messages,
        truncated,
        annotations,
    })
}
