use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Prompt used when neither the request nor the agent supplies one.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer clearly and concisely, and say so when you are unsure.";

pub const DEFAULT_FALLBACK_CONTENT: &str = "I don't have a response for that right now.";

pub const DEFAULT_FAILURE_CONTENT: &str =
    "Sorry, something went wrong while generating a response. Please try again.";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub server: ServerSettings,
    pub defaults: DefaultsSettings,
    pub budget: BudgetSettings,
    pub runs: RunSettings,
    pub paths: PathSettings,
    pub logging: LoggingSettings,
}

impl ParleySettings {
    /// Reject values that parse but cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.defaults.model.trim().is_empty() {
            return Err(SettingsError::InvalidValue("defaults.model is blank".into()));
        }
        if self.budget.max_context_tokens == 0 {
            return Err(SettingsError::InvalidValue("budget.maxContextTokens must be positive".into()));
        }
        if self.budget.max_tool_output_tokens == 0 {
            return Err(SettingsError::InvalidValue("budget.maxToolOutputTokens must be positive".into()));
        }
        if self.runs.checkpoint_every == 0 {
            return Err(SettingsError::InvalidValue("runs.checkpointEvery must be positive".into()));
        }
        if self.runs.fallback_content.trim().is_empty() {
            return Err(SettingsError::InvalidValue("runs.fallbackContent is blank".into()));
        }
        if self.runs.failure_content.trim().is_empty() {
            return Err(SettingsError::InvalidValue("runs.failureContent is blank".into()));
        }
        if self.server.diagnostic_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("server.diagnosticTimeoutMs must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per connection before frames are dropped.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub diagnostic_timeout_ms: u64,
    /// Users allowed to call `diagnostic:*`.
    pub operator_user_ids: Vec<String>,
    /// Bounded wait for in-flight runs on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9191,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            diagnostic_timeout_ms: 5000,
            operator_user_ids: Vec::new(),
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Echo,
    Openai,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefaultsSettings {
    pub model: String,
    /// `""` sends no system prompt at all.
    pub system_prompt: String,
    pub backend: BackendKind,
    pub backend_base_url: String,
    /// Name of the env var holding the backend API key.
    pub backend_api_key_env: String,
    pub backend_idle_timeout_secs: u64,
    pub history_limit: usize,
}

impl Default for DefaultsSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            backend: BackendKind::Echo,
            backend_base_url: "https://api.openai.com/v1".into(),
            backend_api_key_env: "OPENAI_API_KEY".into(),
            backend_idle_timeout_secs: 60,
            history_limit: 200,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetSettings {
    pub max_context_tokens: usize,
    pub max_tool_output_tokens: usize,
    pub max_tools: usize,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: 16_000,
            max_tool_output_tokens: 2_000,
            max_tools: 16,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSettings {
    /// Checkpoint streaming state every N chunks.
    pub checkpoint_every: u32,
    /// How long completed streaming state lingers before purge.
    pub purge_grace_secs: u64,
    pub fallback_content: String,
    pub failure_content: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            checkpoint_every: 8,
            purge_grace_secs: 30,
            fallback_content: DEFAULT_FALLBACK_CONTENT.into(),
            failure_content: DEFAULT_FAILURE_CONTENT.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathSettings {
    pub agents_dir: String,
    pub tools_file: String,
    pub prompts_dir: String,
    pub mention_file_root: String,
    pub database_path: String,
    pub log_database_path: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            agents_dir: "~/.parley/agents".into(),
            tools_file: "~/.parley/tools.json".into(),
            prompts_dir: "~/.parley/prompts".into(),
            mention_file_root: ".".into(),
            database_path: "~/.parley/parley.db".into(),
            log_database_path: "~/.parley/logs.db".into(),
        }
    }
}

impl PathSettings {
    /// Expand a leading `~/` against `$HOME`.
    pub fn resolve(path: &str) -> PathBuf {
        match path.strip_prefix("~/") {
            Some(rest) => home_dir().join(rest),
            None => PathBuf::from(path),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Per-module overrides, e.g. `{"parley_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
    /// Persist warn+ records to the log database.
    pub persist: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            modules: BTreeMap::new(),
            persist: true,
        }
    }
}

pub(crate) fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
