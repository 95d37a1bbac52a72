use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parley_core::tools::{ToolCatalog, ToolDefinition, ToolResolutionError};
use tracing::{debug, warn};

/// Where a registered tool definition came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolSource {
    BuiltIn,
    Catalog(PathBuf),
}

struct ToolEntry {
    definition: ToolDefinition,
    source: ToolSource,
}

/// Agent-scoped view over the registry.
#[derive(Clone, Debug)]
pub enum ToolFilter {
    /// Every registered tool.
    InheritAll,
    /// Only these tools.
    Explicit(HashSet<String>),
}

impl ToolFilter {
    /// An agent without a `tools` list sees the whole registry.
    pub fn from_allow_list(allow: Option<&[String]>) -> Self {
        match allow {
            None => Self::InheritAll,
            Some(names) => Self::Explicit(names.iter().cloned().collect()),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::InheritAll => true,
            Self::Explicit(names) => names.contains(name),
        }
    }
}

/// Registry of tool definitions offered to the model. Registration order is
/// preserved so payloads are stable between turns.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any earlier one with the same name.
    pub fn register(&mut self, definition: ToolDefinition, source: ToolSource) {
        if let Some(existing) = self.tools.iter_mut().find(|e| e.definition.name == definition.name) {
            debug!(tool = %definition.name, "replacing registered tool");
            existing.definition = definition;
            existing.source = source;
            return;
        }
        self.tools.push(ToolEntry { definition, source });
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.tools.len();
        self.tools.retain(|e| e.definition.name != name);
        self.tools.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|e| e.definition.name == name)
    }

    pub fn source(&self, name: &str) -> Option<&ToolSource> {
        self.tools
            .iter()
            .find(|e| e.definition.name == name)
            .map(|e| &e.source)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.definition.name.clone()).collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Definitions visible through `filter`, in registration order.
    pub fn definitions(&self, filter: &ToolFilter) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|e| filter.allows(&e.definition.name))
            .map(|e| e.definition.clone())
            .collect()
    }

    /// Load a JSON array of tool definitions. A missing file yields an
    /// empty registry; an unreadable or unparseable file is an error.
    pub fn load_file(path: &Path) -> Result<Self, ToolResolutionError> {
        let mut registry = Self::new();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "tool catalog not found, starting with no tools");
                return Ok(registry);
            }
            Err(e) => {
                return Err(ToolResolutionError::Unavailable(format!("{}: {e}", path.display())));
            }
        };
        let defs: Vec<ToolDefinition> = serde_json::from_str(&raw)
            .map_err(|e| ToolResolutionError::Unavailable(format!("{}: {e}", path.display())))?;
        for def in defs {
            registry.register(def, ToolSource::Catalog(path.to_path_buf()));
        }
        debug!(path = %path.display(), count = registry.count(), "tool catalog loaded");
        Ok(registry)
    }
}

impl ToolCatalog for ToolRegistry {
    fn list(&self) -> Result<Vec<ToolDefinition>, ToolResolutionError> {
        Ok(self.definitions(&ToolFilter::InheritAll))
    }

    fn get(&self, name: &str) -> Option<ToolDefinition> {
        self.tools
            .iter()
            .find(|e| e.definition.name == name)
            .map(|e| e.definition.clone())
    }
}
