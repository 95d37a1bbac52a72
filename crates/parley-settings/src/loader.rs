//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{home_dir, BackendKind, ParleySettings};

/// `~/.parley/settings.json`
pub fn settings_path() -> PathBuf {
    home_dir().join(".parley").join("settings.json")
}

/// Load from `config` (or the default path) and apply `PARLEY_*` overrides.
pub fn load_settings(config: Option<&Path>) -> Result<ParleySettings> {
    match config {
        Some(path) => load_settings_from_path(path),
        None => load_settings_from_path(&settings_path()),
    }
}

/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ParleySettings = serde_json::from_value(merged)?;
    apply_overrides_with(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup`. Invalid values are ignored with a warning.
pub fn apply_overrides_with(settings: &mut ParleySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_range("PARLEY_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.u64_range("PARLEY_DIAGNOSTIC_TIMEOUT_MS", 100, 600_000) {
        settings.server.diagnostic_timeout_ms = v;
    }
    if let Some(v) = env.string("PARLEY_OPERATORS") {
        settings.server.operator_user_ids = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }

    if let Some(v) = env.string("PARLEY_DEFAULT_MODEL") {
        settings.defaults.model = v;
    }
    if let Some(v) = env.string("PARLEY_BACKEND") {
        match parse_backend(&v) {
            Some(kind) => settings.defaults.backend = kind,
            None => warn!(key = "PARLEY_BACKEND", value = %v, "unknown backend, ignoring"),
        }
    }
    if let Some(v) = env.string("PARLEY_BACKEND_BASE_URL") {
        settings.defaults.backend_base_url = v;
    }

    if let Some(v) = env.u64_range("PARLEY_MAX_CONTEXT_TOKENS", 256, 2_000_000) {
        settings.budget.max_context_tokens = v as usize;
    }
    if let Some(v) = env.u64_range("PARLEY_MAX_TOOL_OUTPUT_TOKENS", 16, 1_000_000) {
        settings.budget.max_tool_output_tokens = v as usize;
    }
    if let Some(v) = env.u64_range("PARLEY_CHECKPOINT_EVERY", 1, 10_000) {
        settings.runs.checkpoint_every = v as u32;
    }

    if let Some(v) = env.string("PARLEY_AGENTS_DIR") {
        settings.paths.agents_dir = v;
    }
    if let Some(v) = env.string("PARLEY_DATABASE_PATH") {
        settings.paths.database_path = v;
    }
    if let Some(v) = env.string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("PARLEY_PERSIST_LOGS") {
        match parse_bool(&v) {
            Some(b) => settings.logging.persist = b,
            None => warn!(key = "PARLEY_PERSIST_LOGS", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_backend(val: &str) -> Option<BackendKind> {
    match val.to_lowercase().as_str() {
        "echo" => Some(BackendKind::Echo),
        "openai" => Some(BackendKind::Openai),
        _ => None,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64_range(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
