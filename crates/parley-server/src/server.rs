use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parley_core::store::{ConnectionLog, ConversationStore, MessageStore};
use parley_engine::{ContextAssembler, EventBus, RunDriver, StateReconciler};
use parley_settings::ServerSettings;
use parley_telemetry::BroadcastLogSink;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::auth::Authenticator;
use crate::client::{self, ConnectionRegistry};
use crate::diagnostics::DiagnosticDesk;
use crate::event_bridge;
use crate::handlers::HandlerState;
use crate::orchestrator::{EngineOrchestrator, TurnOrchestrator};
use crate::protocol;

/// Finished turns stay in the in-memory ledger this long.
const LEDGER_RETENTION: Duration = Duration::from_secs(600);
const LEDGER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub diagnostic_timeout: Duration,
    pub operator_user_ids: Vec<String>,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_send_queue: s.max_send_queue,
            heartbeat_interval: Duration::from_secs(s.heartbeat_interval_secs.max(1)),
            client_timeout: Duration::from_secs(s.client_timeout_secs.max(1)),
            diagnostic_timeout: Duration::from_millis(s.diagnostic_timeout_ms),
            operator_user_ids: s.operator_user_ids.clone(),
            shutdown_grace: Duration::from_secs(s.shutdown_grace_secs),
        }
    }
}

/// Engine collaborators the gateway is wired to.
#[derive(Clone)]
pub struct GatewayServices {
    pub assembler: Arc<ContextAssembler>,
    pub driver: Arc<RunDriver>,
    pub reconciler: Arc<StateReconciler>,
    pub bus: EventBus,
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
    pub connection_log: Arc<dyn ConnectionLog>,
    /// Source of live log records for `diagnostics:logs` subscribers.
    pub live_logs: Option<BroadcastLogSink>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub heartbeat: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, services: GatewayServices) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(
        ConnectionRegistry::new(config.max_send_queue).with_log(Arc::clone(&services.connection_log)),
    );

    let mut background = vec![event_bridge::create_bridge(Arc::clone(&registry), services.bus.subscribe())];
    if let Some(live_logs) = &services.live_logs {
        background.push(event_bridge::create_log_bridge(Arc::clone(&registry), live_logs.subscribe()));
    }
    background.push(client::start_cleanup_task(
        Arc::clone(&registry),
        CLEANUP_INTERVAL.min(config.client_timeout),
        config.client_timeout,
    ));

    let orchestrator = Arc::new(EngineOrchestrator::new(&services, Arc::clone(&registry)));
    background.push(start_ledger_pruning(Arc::clone(&orchestrator)));

    let handler_state = Arc::new(HandlerState {
        registry: Arc::clone(&registry),
        orchestrator: orchestrator.clone(),
        diagnostics: DiagnosticDesk::new(Arc::clone(&services.reconciler), config.diagnostic_timeout),
        authenticator: Authenticator::new(config.operator_user_ids.iter().cloned()),
        conversations: Arc::clone(&services.conversations),
        messages: Arc::clone(&services.messages),
    });

    let router = build_router(AppState {
        handler_state,
        heartbeat: config.heartbeat_interval,
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "parley server started");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        cancel,
        registry,
        orchestrator,
        grace: config.shutdown_grace,
        server,
        background,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    orchestrator: Arc<EngineOrchestrator>,
    grace: Duration,
    server: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn connections(&self) -> usize {
        self.registry.count()
    }

    pub fn active_runs(&self) -> usize {
        self.orchestrator.active_runs()
    }

    /// Stop accepting connections, disconnect clients, then give in-flight
    /// runs up to the configured grace period to finish their durable write.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let closed = self.registry.close_all("server_shutdown");
        tracing::info!(closed, active_runs = self.orchestrator.active_runs(), "shutting down");

        let drained = self.orchestrator.drain(self.grace).await;
        if tokio::time::timeout(self.grace, self.server).await.is_err() {
            tracing::warn!("http server did not stop within grace period");
        }
        for task in &self.background {
            task.abort();
        }
        tracing::info!(drained, "server stopped");
    }
}

fn start_ledger_pruning(orchestrator: Arc<EngineOrchestrator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LEDGER_PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            let pruned = orchestrator.ledger().prune(LEDGER_RETENTION);
            if pruned > 0 {
                tracing::debug!(pruned, "pruned turn ledger");
            }
        }
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let registry = Arc::clone(&state.handler_state.registry);
    let (client_id, rx) = registry.register();
    tracing::info!(client_id = %client_id, "websocket client connected");

    if let Some(frame) = protocol::encode_frame("connected", serde_json::json!({ "clientId": client_id })) {
        registry.send_to(&client_id, frame);
    }

    client::handle_ws_connection(socket, client_id, rx, state.handler_state, state.heartbeat).await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let hs = &state.handler_state;
    let mut body = serde_json::json!({
        "status": "healthy",
        "connections": hs.registry.count(),
        "activeRuns": hs.orchestrator.active_runs(),
        "pendingDiagnostics": hs.diagnostics.pending(),
    });
    if let Some((operation, age)) = hs.diagnostics.oldest_pending() {
        body["oldestDiagnostic"] = serde_json::json!({
            "operation": operation,
            "ageMs": u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
        });
    }
    axum::Json(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn config_from_settings() {
        let settings = ServerSettings {
            port: 1234,
            diagnostic_timeout_ms: 250,
            heartbeat_interval_secs: 0,
            operator_user_ids: vec!["ops".into()],
            ..Default::default()
        };
        let config = ServerConfig::from(&settings);
        assert_eq!(config.port, 1234);
        assert_eq!(config.diagnostic_timeout, Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.operator_user_ids, vec!["ops".to_string()]);
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let fx = Fixture::new(vec![]);
        let handle = start(test_config(), fx.services.clone()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["activeRuns"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn build_router_creates_routes() {
        let fx = Fixture::new(vec![]);
        let handler_state = Arc::new(HandlerState {
            registry: Arc::clone(&fx.registry),
            orchestrator: Arc::new(fx.orchestrator()),
            diagnostics: DiagnosticDesk::new(Arc::clone(&fx.services.reconciler), Duration::from_secs(5)),
            authenticator: Authenticator::new(Vec::new()),
            conversations: Arc::clone(&fx.services.conversations),
            messages: Arc::clone(&fx.services.messages),
        });

        let _router = build_router(AppState {
            handler_state,
            heartbeat: Duration::from_secs(30),
        });
    }
}
