//! Shared fixture for this crate's unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::agents::AgentConfig;
use parley_core::ids::{ClientId, ConversationId, UserId};
use parley_core::messages::TurnMessage;
use parley_core::tools::{ToolCatalog, ToolDefinition};
use parley_engine::agents::InMemoryAgentRegistry;
use parley_engine::context::budget::BudgetLimits;
use parley_engine::context::mentions::{MentionResolver, ToolMentionProvider};
use parley_engine::reconcile::ephemeral::InMemoryEphemeralStore;
use parley_engine::registry::ToolSource;
use parley_engine::{AssemblerConfig, ContextAssembler, EventBus, RunConfig, RunDriver, StateReconciler, ToolRegistry};
use parley_llm::mock::{MockBackend, MockResponse};
use parley_store::Store;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::auth::Identity;
use crate::client::ConnectionRegistry;
use crate::event_bridge;
use crate::orchestrator::EngineOrchestrator;
use crate::server::GatewayServices;

pub const FAILURE_CONTENT: &str = "Sorry, that reply could not be generated.";

pub fn identity(user: &str) -> Identity {
    Identity {
        user_id: UserId::from_raw(user),
        username: None,
        operator: user.starts_with("ops"),
    }
}

pub struct Fixture {
    pub store: Store,
    pub backend: Arc<MockBackend>,
    pub services: GatewayServices,
    pub registry: Arc<ConnectionRegistry>,
    inboxes: Mutex<HashMap<ClientId, mpsc::Receiver<String>>>,
}

impl Fixture {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self::with_agents(responses, Vec::new())
    }

    pub fn with_agents(responses: Vec<MockResponse>, agents: Vec<AgentConfig>) -> Self {
        let store = Store::in_memory().unwrap();
        let backend = Arc::new(MockBackend::new(responses));

        let mut tools = ToolRegistry::new();
        tools.register(
            ToolDefinition {
                name: "weather".into(),
                description: "Current weather for a city".into(),
                parameters_schema: serde_json::json!({"type": "object", "properties": {}}),
            },
            ToolSource::BuiltIn,
        );
        let catalog: Arc<dyn ToolCatalog> = Arc::new(tools);
        let mentions = MentionResolver::new().with_provider(Arc::new(ToolMentionProvider::new(Arc::clone(&catalog))));

        let assembler = Arc::new(ContextAssembler::new(
            Arc::new(InMemoryAgentRegistry::with_agents(agents)),
            catalog,
            mentions,
            Arc::new(store.messages.clone()),
            Arc::new(store.audit.clone()),
            AssemblerConfig {
                default_model: "test-model".into(),
                default_system_prompt: Some("You are helpful.".into()),
                limits: BudgetLimits {
                    max_context_tokens: 16_000,
                    max_tool_output_tokens: 2_000,
                },
                max_tools: 16,
                history_limit: 50,
            },
        ));
        let reconciler = Arc::new(
            StateReconciler::new(Arc::new(store.messages.clone()), Arc::new(InMemoryEphemeralStore::new()))
                .with_retry_delay(Duration::from_millis(1)),
        );
        let bus = EventBus::new(1024);
        let driver = Arc::new(RunDriver::new(
            backend.clone(),
            Arc::clone(&reconciler),
            bus.clone(),
            RunConfig {
                checkpoint_every: 2,
                fallback_content: "Nothing to add.".into(),
                failure_content: FAILURE_CONTENT.into(),
            },
            Duration::from_millis(50),
        ));

        let services = GatewayServices {
            assembler,
            driver,
            reconciler,
            bus: bus.clone(),
            conversations: Arc::new(store.conversations.clone()),
            messages: Arc::new(store.messages.clone()),
            connection_log: Arc::new(store.connections.clone()),
            live_logs: None,
        };
        let registry = Arc::new(ConnectionRegistry::new(256));
        event_bridge::create_bridge(Arc::clone(&registry), bus.subscribe());

        Self {
            store,
            backend,
            services,
            registry,
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn orchestrator(&self) -> EngineOrchestrator {
        EngineOrchestrator::new(&self.services, Arc::clone(&self.registry))
    }

    /// Register an authenticated connection and keep its outbound queue.
    pub fn connect(&self, user: &str) -> ClientId {
        let (id, rx) = self.registry.register();
        self.registry.set_identity(&id, identity(user));
        self.inboxes.lock().insert(id.clone(), rx);
        id
    }

    /// Frames queued for `client` so far.
    pub fn frames(&self, client: &ClientId) -> Vec<Value> {
        let mut inboxes = self.inboxes.lock();
        let Some(rx) = inboxes.get_mut(client) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            out.push(serde_json::from_str(&raw).unwrap());
        }
        out
    }

    pub async fn history(&self, conversation_id: &ConversationId) -> Vec<TurnMessage> {
        self.store.messages.recent(conversation_id, 100).unwrap()
    }
}
