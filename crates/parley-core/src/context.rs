use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, ConversationId, MessageId};
use crate::messages::TurnMessage;
use crate::tools::ToolDefinition;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    UnresolvedMention,
    ToolDegraded,
    OutputTruncated,
    HistoryPruned,
}

/// Non-fatal note produced while assembling a turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub detail: String,
}

impl Annotation {
    pub fn new(kind: AnnotationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStats {
    pub budget: usize,
    pub estimated_before: usize,
    pub estimated_after: usize,
    pub system_tokens: usize,
    pub tool_tokens: usize,
    pub history_tokens: usize,
    pub pruned_messages: usize,
    pub truncated_outputs: usize,
}

/// Everything the backend needs for one turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnPackage {
    pub conversation_id: ConversationId,
    pub turn_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<TurnMessage>,
    pub tools: Vec<ToolDefinition>,
    pub budget: BudgetStats,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl TurnPackage {
    /// The user message this turn answers.
    pub fn current_message(&self) -> Option<&TurnMessage> {
        self.messages.iter().rev().find(|m| m.id == self.turn_id)
    }
}
