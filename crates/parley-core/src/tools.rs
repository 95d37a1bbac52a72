use serde::{Deserialize, Serialize};

/// Tool definition sent to the backend as part of the turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub parameters_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ToolResolutionError {
    #[error("tool {name} is invalid: {reason}")]
    Invalid { name: String, reason: String },
    #[error("tool catalog unavailable: {0}")]
    Unavailable(String),
}

impl ToolDefinition {
    pub fn validate(&self) -> Result<(), ToolResolutionError> {
        if self.name.trim().is_empty() {
            return Err(ToolResolutionError::Invalid {
                name: self.name.clone(),
                reason: "blank name".into(),
            });
        }
        if !self.parameters_schema.is_object() {
            return Err(ToolResolutionError::Invalid {
                name: self.name.clone(),
                reason: "parameters schema is not an object".into(),
            });
        }
        Ok(())
    }
}

/// Source of tool definitions available to agents.
pub trait ToolCatalog: Send + Sync {
    fn list(&self) -> Result<Vec<ToolDefinition>, ToolResolutionError>;

    fn get(&self, name: &str) -> Option<ToolDefinition>;
}
