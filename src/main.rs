use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::agents::AgentRegistry;
use parley_core::tools::ToolCatalog;
use parley_engine::agents::DirectoryAgentRegistry;
use parley_engine::context::budget::BudgetLimits;
use parley_engine::context::mentions::{
    FileMentionProvider, MentionResolver, PromptMentionProvider, ToolMentionProvider, UrlMentionProvider,
};
use parley_engine::reconcile::ephemeral::InMemoryEphemeralStore;
use parley_engine::{AssemblerConfig, ContextAssembler, EventBus, RunConfig, RunDriver, StateReconciler, ToolRegistry};
use parley_server::{GatewayServices, ServerConfig};
use parley_settings::{ParleySettings, PathSettings};
use parley_store::Store;
use parley_telemetry::TelemetryConfig;

const URL_MENTION_TIMEOUT: Duration = Duration::from_secs(10);
const URL_MENTION_MAX_BYTES: usize = 256 * 1024;

#[derive(Debug, Parser)]
#[command(name = "parley", about = "Real-time conversational assistant gateway")]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Overrides `logging.level`; RUST_LOG still wins.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = parley_settings::load_settings(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }

    let telemetry = parley_telemetry::init_telemetry(telemetry_config(&settings));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting parley");

    let db_path = PathSettings::resolve(&settings.paths.database_path);
    let store = Store::open(&db_path).with_context(|| format!("failed to open database {}", db_path.display()))?;

    let mut services = build_services(&settings, &store)?;
    services.live_logs = Some(telemetry.live_logs().clone());

    let handle = parley_server::start(ServerConfig::from(&settings.server), services)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    handle.shutdown().await;
    Ok(())
}

fn telemetry_config(settings: &ParleySettings) -> TelemetryConfig {
    let logging = &settings.logging;
    TelemetryConfig {
        log_level: parley_telemetry::parse_level(&logging.level),
        module_levels: logging
            .modules
            .iter()
            .map(|(module, level)| (module.clone(), parley_telemetry::parse_level(level)))
            .collect(),
        log_to_sqlite: logging.persist,
        log_db_path: PathSettings::resolve(&settings.paths.log_database_path),
        ..Default::default()
    }
}

fn build_services(settings: &ParleySettings, store: &Store) -> Result<GatewayServices> {
    let paths = &settings.paths;

    let agents: Arc<dyn AgentRegistry> = Arc::new(DirectoryAgentRegistry::new(PathSettings::resolve(&paths.agents_dir)));
    let tools_file = PathSettings::resolve(&paths.tools_file);
    let tools = ToolRegistry::load_file(&tools_file).with_context(|| format!("failed to load {}", tools_file.display()))?;
    tracing::info!(tools = tools.count(), "tool catalog ready");
    let catalog: Arc<dyn ToolCatalog> = Arc::new(tools);

    let mentions = MentionResolver::new()
        .with_provider(Arc::new(ToolMentionProvider::new(Arc::clone(&catalog))))
        .with_provider(Arc::new(FileMentionProvider::new(PathSettings::resolve(&paths.mention_file_root))))
        .with_provider(Arc::new(PromptMentionProvider::new(PathSettings::resolve(&paths.prompts_dir))))
        .with_provider(Arc::new(
            UrlMentionProvider::new(URL_MENTION_TIMEOUT, URL_MENTION_MAX_BYTES).context("failed to build url fetcher")?,
        ));

    let defaults = &settings.defaults;
    let assembler = Arc::new(ContextAssembler::new(
        agents,
        catalog,
        mentions,
        Arc::new(store.messages.clone()),
        Arc::new(store.audit.clone()),
        AssemblerConfig {
            default_model: defaults.model.clone(),
            default_system_prompt: Some(defaults.system_prompt.clone()).filter(|p| !p.trim().is_empty()),
            limits: BudgetLimits {
                max_context_tokens: settings.budget.max_context_tokens,
                max_tool_output_tokens: settings.budget.max_tool_output_tokens,
            },
            max_tools: settings.budget.max_tools,
            history_limit: defaults.history_limit,
        },
    ));

    let reconciler = Arc::new(StateReconciler::new(
        Arc::new(store.messages.clone()),
        Arc::new(InMemoryEphemeralStore::new()),
    ));
    let backend = parley_llm::backend_from_settings(defaults).context("failed to configure model backend")?;
    tracing::info!(backend = ?defaults.backend, model = %defaults.model, "model backend ready");

    let bus = EventBus::new(1024);
    let driver = Arc::new(RunDriver::new(
        backend,
        Arc::clone(&reconciler),
        bus.clone(),
        RunConfig {
            checkpoint_every: settings.runs.checkpoint_every,
            fallback_content: settings.runs.fallback_content.clone(),
            failure_content: settings.runs.failure_content.clone(),
        },
        Duration::from_secs(settings.runs.purge_grace_secs),
    ));

    Ok(GatewayServices {
        assembler,
        driver,
        reconciler,
        bus,
        conversations: Arc::new(store.conversations.clone()),
        messages: Arc::new(store.messages.clone()),
        connection_log: Arc::new(store.connections.clone()),
        live_logs: None,
    })
}
