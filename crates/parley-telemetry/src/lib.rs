mod logging;
mod sink;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogStore};
pub use sink::{BroadcastLogSink, DiagnosticLogLayer, LogEntry, LogSink};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "parley_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    /// Lowest level forwarded to live diagnostic subscribers.
    pub diagnostic_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: home.join(".parley/logs.db"),
            diagnostic_level: Level::INFO,
        }
    }
}

/// Handle to the installed telemetry stack.
pub struct TelemetryGuard {
    log_store: Option<Arc<SqliteLogStore>>,
    live_logs: BroadcastLogSink,
    base_level: Level,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    filter_handle: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let filter = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        if let Err(e) = self.filter_handle.reload(EnvFilter::new(filter)) {
            tracing::warn!(error = %e, module, "failed to reload log filter");
        }
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Persisted warn+ records, when SQLite logging is enabled.
    pub fn logs(&self) -> Option<&SqliteLogStore> {
        self.log_store.as_deref()
    }

    /// Live record fan-out for diagnostic subscribers.
    pub fn live_logs(&self) -> &BroadcastLogSink {
        &self.live_logs
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let module_levels = Arc::new(RwLock::new(config.module_levels.clone()));

    let filter_str = filter_directives(config.log_level, &config.module_levels);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true);

    let (sqlite_layer, log_store) = if config.log_to_sqlite {
        match SqliteLogStore::open(&config.log_db_path) {
            Ok(store) => {
                let store = Arc::new(store);
                (Some(SqliteLogLayer::new(store.clone())), Some(store))
            }
            Err(e) => {
                eprintln!("parley-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let live_logs = BroadcastLogSink::default();
    let diagnostic_layer = DiagnosticLogLayer::new(Arc::new(live_logs.clone()), config.diagnostic_level);

    if let Err(e) = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(sqlite_layer)
        .with(diagnostic_layer)
        .try_init()
    {
        eprintln!("parley-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        log_store,
        live_logs,
        base_level: config.log_level,
        module_levels,
        filter_handle,
    }
}

fn filter_directives(base: Level, modules: &[(String, Level)]) -> String {
    let mut filter = base.to_string().to_lowercase();
    for (module, level) in modules {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Parse a level name from settings; unknown names fall back to INFO.
pub fn parse_level(s: &str) -> Level {
    s.parse().unwrap_or(Level::INFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_modules() {
        let d = filter_directives(Level::INFO, &[("parley_engine".into(), Level::DEBUG)]);
        assert_eq!(d, "info,parley_engine=debug");
    }

    #[test]
    fn parse_level_falls_back() {
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("loud"), Level::INFO);
    }
}
