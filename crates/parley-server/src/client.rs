use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_core::events::{Delivery, OutboundEvent, ServerEvent, Topic};
use parley_core::ids::{ClientId, UserId};
use parley_core::store::{ConnectionEvent, ConnectionEventKind, ConnectionLog, PersistenceFailure};
use tokio::sync::mpsc;

use crate::auth::Identity;
use crate::handlers::{self, HandlerState};
use crate::protocol;

/// A connected WebSocket client.
pub struct Connection {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    connected_at: Instant,
    connected: AtomicBool,
    last_pong: AtomicU64,
    state: Mutex<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    identity: Option<Identity>,
    topics: HashSet<Topic>,
}

impl Connection {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected_at: Instant::now(),
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            state: Mutex::new(ConnectionState::default()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.lock().identity.clone()
    }

    fn user_id(&self) -> Option<UserId> {
        self.state.lock().identity.as_ref().map(|i| i.user_id.clone())
    }

    fn in_any(&self, topics: &[Topic]) -> bool {
        let state = self.state.lock();
        topics.iter().any(|t| state.topics.contains(t))
    }

    fn try_send(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                // Stays below warn: live log delivery runs through here.
                tracing::debug!(client_id = %self.id, msg_len = msg.len(), "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Used when no connection log is configured.
pub struct NoopConnectionLog;

#[async_trait]
impl ConnectionLog for NoopConnectionLog {
    async fn record(&self, _event: ConnectionEvent) -> Result<(), PersistenceFailure> {
        Ok(())
    }
}

/// Every live connection, its identity and its topic memberships.
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Arc<Connection>>,
    max_send_queue: usize,
    log: Arc<dyn ConnectionLog>,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
            log: Arc::new(NoopConnectionLog),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn ConnectionLog>) -> Self {
        self.log = log;
        self
    }

    /// Register a new connection and return its id and outbound queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections.insert(id.clone(), Arc::new(Connection::new(id.clone(), tx)));
        self.record(ConnectionEvent::new(ConnectionEventKind::Connect, id.clone()));
        (id, rx)
    }

    /// Remove a connection, logging the disconnect with its lifetime.
    pub fn unregister(&self, id: &ClientId, reason: &str) -> bool {
        let Some((_, conn)) = self.connections.remove(id) else {
            return false;
        };
        conn.connected.store(false, Ordering::Relaxed);
        let duration_ms = u64::try_from(conn.connected_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut event = ConnectionEvent::new(ConnectionEventKind::Disconnect, id.clone())
            .with_reason(reason)
            .with_duration_ms(duration_ms);
        if let Some(user) = conn.user_id() {
            event = event.with_user(user);
        }
        tracing::info!(client_id = %id, reason, duration_ms, "client disconnected");
        self.record(event);
        true
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn set_identity(&self, id: &ClientId, identity: Identity) -> bool {
        let Some(conn) = self.get(id) else {
            return false;
        };
        let event = ConnectionEvent::new(ConnectionEventKind::Auth, id.clone()).with_user(identity.user_id.clone());
        conn.state.lock().identity = Some(identity);
        self.record(event);
        true
    }

    pub fn record_auth_rejected(&self, id: &ClientId, reason: &str) {
        self.record(ConnectionEvent::new(ConnectionEventKind::AuthRejected, id.clone()).with_reason(reason));
    }

    pub fn identity(&self, id: &ClientId) -> Option<Identity> {
        self.get(id).and_then(|c| c.identity())
    }

    /// Returns true if the connection was not already a member.
    pub fn join(&self, id: &ClientId, topic: Topic) -> bool {
        self.get(id).is_some_and(|c| c.state.lock().topics.insert(topic))
    }

    pub fn leave(&self, id: &ClientId, topic: &Topic) -> bool {
        self.get(id).is_some_and(|c| c.state.lock().topics.remove(topic))
    }

    pub fn topics(&self, id: &ClientId) -> Vec<Topic> {
        self.get(id)
            .map(|c| c.state.lock().topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn members(&self, topic: &Topic) -> Vec<ClientId> {
        self.connections
            .iter()
            .filter(|c| c.state.lock().topics.contains(topic))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Queue a raw frame for one connection. Drops the frame if the queue is full.
    pub fn send_to(&self, id: &ClientId, message: String) -> bool {
        match self.get(id) {
            Some(conn) if conn.is_connected() => conn.try_send(message),
            _ => false,
        }
    }

    pub fn send_event(&self, id: &ClientId, event: &ServerEvent) -> bool {
        protocol::encode_event(event).is_some_and(|frame| self.send_to(id, frame))
    }

    /// Fan a frame out to every member of any of `topics`, once per
    /// connection. Best effort: full or closed queues are skipped.
    pub fn broadcast(&self, topics: &[Topic], except: Option<&ClientId>, frame: &str) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            let conn = entry.value();
            if Some(&conn.id) == except || !conn.is_connected() || !conn.in_any(topics) {
                continue;
            }
            if conn.try_send(frame.to_string()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn deliver(&self, outbound: &OutboundEvent) -> usize {
        let Some(frame) = protocol::encode_event(&outbound.event) else {
            return 0;
        };
        match &outbound.delivery {
            Delivery::Client(id) => usize::from(self.send_to(id, frame)),
            Delivery::Topics { topics, except } => self.broadcast(topics, except.as_ref(), &frame),
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Remove connections that haven't answered a ping within `timeout`.
    pub fn cleanup_dead_clients(&self, timeout: Duration) -> usize {
        let dead: Vec<ClientId> = self
            .connections
            .iter()
            .filter(|c| !c.is_alive(timeout))
            .map(|c| c.id.clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.unregister(&id, "timeout") {
                removed += 1;
            }
        }
        removed
    }

    /// Disconnect everyone, e.g. on shutdown.
    pub fn close_all(&self, reason: &str) -> usize {
        let ids: Vec<ClientId> = self.connections.iter().map(|c| c.id.clone()).collect();
        ids.iter().filter(|id| self.unregister(id, reason)).count()
    }

    /// Connection log writes never block or fail the connection lifecycle.
    fn record(&self, event: ConnectionEvent) {
        let log = Arc::clone(&self.log);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let kind = event.kind.as_str();
            if let Err(e) = log.record(event).await {
                tracing::warn!(kind, error = %e, "failed to record connection event");
            }
        });
    }
}

/// Handle a WebSocket connection: split into reader/writer, manage lifecycle
/// with heartbeat. Frames from one connection are handled in arrival order.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    state: Arc<HandlerState>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let registry = Arc::clone(&state.registry);

    let writer_cid = client_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_cid = client_id.clone();
    let reader_state = Arc::clone(&state);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if let Some(reply) = handlers::handle_frame(&reader_state, &reader_cid, text.as_str()).await {
                        reader_state.registry.send_to(&reader_cid, reply);
                    }
                }
                WsMessage::Pong(_) => {
                    if let Some(conn) = reader_state.registry.get(&reader_cid) {
                        conn.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    // Already gone if the cleanup task timed it out.
    registry.unregister(&client_id, "closed");
}

/// Start a background task that periodically removes dead connections.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    client_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients(client_timeout);
            if removed > 0 {
                tracing::info!(removed, "dead client cleanup");
            }
        }
    })
}
