use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

/// Per-agent overrides for model, prompt and tool access.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: AgentId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Allow-list of tool names. `None` means every registered tool.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: AgentId::from_raw(id),
            name: None,
            model: None,
            system_prompt: None,
            tools: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentLookupError {
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("agent {id} is malformed: {reason}")]
    Malformed { id: String, reason: String },
    #[error("invalid agent id: {0}")]
    InvalidId(String),
    #[error("agent io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn get(&self, id: &AgentId) -> Result<AgentConfig, AgentLookupError>;
}
