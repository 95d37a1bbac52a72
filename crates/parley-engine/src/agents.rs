use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use parley_core::agents::{AgentConfig, AgentLookupError, AgentRegistry};
use parley_core::ids::AgentId;
use tracing::{debug, instrument, warn};

/// Agent ids double as file names, so only a conservative alphabet is allowed.
pub fn validate_agent_id(id: &str) -> Result<(), AgentLookupError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AgentLookupError::InvalidId(id.to_string()))
    }
}

/// Loads `<dir>/<agentId>.json` on every lookup.
pub struct DirectoryAgentRegistry {
    dir: PathBuf,
}

impl DirectoryAgentRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl AgentRegistry for DirectoryAgentRegistry {
    #[instrument(skip(self), fields(agent_id = %id))]
    async fn get(&self, id: &AgentId) -> Result<AgentConfig, AgentLookupError> {
        validate_agent_id(id.as_str())?;
        let path = self.dir.join(format!("{}.json", id.as_str()));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "agent file missing");
                return Err(AgentLookupError::NotFound(id.to_string()));
            }
            Err(e) => return Err(AgentLookupError::Io(e)),
        };

        let mut config: AgentConfig = serde_json::from_str(&raw).map_err(|e| {
            warn!(path = %path.display(), error = %e, "agent file failed to parse");
            AgentLookupError::Malformed {
                id: id.to_string(),
                reason: e.to_string(),
            }
        })?;

        if config.id != *id {
            return Err(AgentLookupError::Malformed {
                id: id.to_string(),
                reason: format!("file declares id '{}'", config.id),
            });
        }
        if config.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            config.model = None;
        }
        Ok(config)
    }
}

/// Registry backed by a map, used for embedded setups and tests.
#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentConfig>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(agents: impl IntoIterator<Item = AgentConfig>) -> Self {
        let registry = Self::new();
        for agent in agents {
            registry.insert(agent);
        }
        registry
    }

    pub fn insert(&self, agent: AgentConfig) {
        self.agents.write().insert(agent.id.clone(), agent);
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn get(&self, id: &AgentId) -> Result<AgentConfig, AgentLookupError> {
        self.agents
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AgentLookupError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_agent(dir: &std::path::Path, id: &str, body: &str) {
        std::fs::write(dir.join(format!("{id}.json")), body).unwrap();
    }

    #[tokio::test]
    async fn loads_agent_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(
            dir.path(),
            "support",
            r#"{"id":"support","model":"gpt-4o","systemPrompt":"Be kind.","tools":["search"]}"#,
        );
        let registry = DirectoryAgentRegistry::new(dir.path());
        let agent = registry.get(&AgentId::from_raw("support")).await.unwrap();
        assert_eq!(agent.model.as_deref(), Some("gpt-4o"));
        assert_eq!(agent.system_prompt.as_deref(), Some("Be kind."));
        assert_eq!(agent.tools, Some(vec!["search".to_string()]));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirectoryAgentRegistry::new(dir.path());
        let err = registry.get(&AgentId::from_raw("missing-agent")).await.unwrap_err();
        assert!(matches!(err, AgentLookupError::NotFound(id) if id == "missing-agent"));
    }

    #[tokio::test]
    async fn parse_failure_is_malformed_not_missing() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "broken", "{ nope");
        let registry = DirectoryAgentRegistry::new(dir.path());
        let err = registry.get(&AgentId::from_raw("broken")).await.unwrap_err();
        assert!(matches!(err, AgentLookupError::Malformed { .. }));
    }

    #[tokio::test]
    async fn mismatched_id_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(dir.path(), "a", r#"{"id":"b"}"#);
        let registry = DirectoryAgentRegistry::new(dir.path());
        let err = registry.get(&AgentId::from_raw("a")).await.unwrap_err();
        assert!(matches!(err, AgentLookupError::Malformed { .. }));
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirectoryAgentRegistry::new(dir.path());
        let err = registry.get(&AgentId::from_raw("../etc/passwd")).await.unwrap_err();
        assert!(matches!(err, AgentLookupError::InvalidId(_)));
    }

    #[tokio::test]
    async fn in_memory_lookup() {
        let registry = InMemoryAgentRegistry::with_agents([AgentConfig::new("helper")]);
        assert!(registry.get(&AgentId::from_raw("helper")).await.is_ok());
        assert!(matches!(
            registry.get(&AgentId::from_raw("other")).await,
            Err(AgentLookupError::NotFound(_))
        ));
    }
}
